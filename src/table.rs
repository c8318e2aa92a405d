use std::cell::RefCell;
use std::rc::Rc;

use crate::module::TableType;
use crate::trap::Trap;

/// Keeps a runaway `table.grow` from exhausting host memory; growth past
/// this reports failure (-1), which conforming modules must handle.
const MAX_ENTRIES: u64 = 1 << 24;

/// A table instance. Elements are stored as reference bit patterns
/// (0 = null, otherwise a funcref registry id or externref handle), the
/// same encoding frame slots use.
pub struct Table {
    ty: TableType,
    elems: RefCell<Vec<u64>>,
}

impl Table {
    pub fn new(ty: TableType) -> Self {
        Table { ty, elems: RefCell::new(vec![0; ty.min as usize]) }
    }

    pub(crate) fn ty(&self) -> &TableType {
        &self.ty
    }

    pub fn size(&self) -> u32 {
        self.elems.borrow().len() as u32
    }

    pub(crate) fn get(&self, idx: u32) -> Result<u64, Trap> {
        self.elems
            .borrow()
            .get(idx as usize)
            .copied()
            .ok_or(Trap::TableOutOfBounds)
    }

    pub(crate) fn set(&self, idx: u32, bits: u64) -> Result<(), Trap> {
        let mut elems = self.elems.borrow_mut();
        match elems.get_mut(idx as usize) {
            Some(slot) => {
                *slot = bits;
                Ok(())
            }
            None => Err(Trap::TableOutOfBounds),
        }
    }

    /// Grow by `delta` entries initialised to `init_bits`; returns the
    /// old size, or -1 when limits forbid the growth.
    pub(crate) fn grow(&self, init_bits: u64, delta: u32) -> i32 {
        let mut elems = self.elems.borrow_mut();
        let old = elems.len() as u64;
        let new = old + delta as u64;
        if new > self.ty.max.unwrap_or(u32::MAX as u64) || new > MAX_ENTRIES {
            return -1;
        }
        elems.resize(new as usize, init_bits);
        old as i32
    }

    pub(crate) fn fill(&self, dst: u32, bits: u64, len: u32) -> Result<(), Trap> {
        let mut elems = self.elems.borrow_mut();
        let end = dst as u64 + len as u64;
        if end > elems.len() as u64 {
            return Err(Trap::TableOutOfBounds);
        }
        elems[dst as usize..end as usize].fill(bits);
        Ok(())
    }

    /// `table.init`: copy a slice of a (resolved) element segment.
    pub(crate) fn init(&self, dst: u32, src: u32, len: u32, seg: &[u64]) -> Result<(), Trap> {
        let src_end = src as u64 + len as u64;
        let dst_end = dst as u64 + len as u64;
        let mut elems = self.elems.borrow_mut();
        if src_end > seg.len() as u64 || dst_end > elems.len() as u64 {
            return Err(Trap::TableOutOfBounds);
        }
        elems[dst as usize..dst_end as usize]
            .copy_from_slice(&seg[src as usize..src_end as usize]);
        Ok(())
    }

    /// `table.copy`, handling the self-copy (overlap) case.
    pub(crate) fn copy(dst: &Rc<Table>, src: &Rc<Table>, d: u32, s: u32, len: u32) -> Result<(), Trap> {
        let s_end = s as u64 + len as u64;
        let d_end = d as u64 + len as u64;
        if Rc::ptr_eq(dst, src) {
            let mut elems = dst.elems.borrow_mut();
            if s_end > elems.len() as u64 || d_end > elems.len() as u64 {
                return Err(Trap::TableOutOfBounds);
            }
            elems.copy_within(s as usize..s_end as usize, d as usize);
        } else {
            let src_elems = src.elems.borrow();
            let mut dst_elems = dst.elems.borrow_mut();
            if s_end > src_elems.len() as u64 || d_end > dst_elems.len() as u64 {
                return Err(Trap::TableOutOfBounds);
            }
            dst_elems[d as usize..d_end as usize]
                .copy_from_slice(&src_elems[s as usize..s_end as usize]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmparser::{RefType, ValType};

    fn table(min: u64, max: Option<u64>) -> Table {
        Table::new(TableType { element: ValType::Ref(RefType::FUNCREF), min, max })
    }

    #[test]
    fn new_tables_are_null() {
        let t = table(3, None);
        assert_eq!(t.size(), 3);
        assert_eq!(t.get(2).unwrap(), 0);
        assert!(matches!(t.get(3), Err(Trap::TableOutOfBounds)));
    }

    #[test]
    fn grow_fills_with_init_value() {
        let t = table(1, Some(4));
        assert_eq!(t.grow(7, 2), 1);
        assert_eq!(t.get(1).unwrap(), 7);
        assert_eq!(t.get(2).unwrap(), 7);
        assert_eq!(t.grow(0, 5), -1);
    }

    #[test]
    fn self_copy_preserves_overlap() {
        let t = Rc::new(table(5, None));
        for i in 0..5 {
            t.set(i, (i + 1) as u64).unwrap();
        }
        Table::copy(&t, &t, 1, 0, 4).unwrap();
        assert_eq!(
            (0..5).map(|i| t.get(i).unwrap()).collect::<Vec<_>>(),
            vec![1, 1, 2, 3, 4]
        );
    }
}
