//! Array storage: the `A` side of component B.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Behaviour shared by every array storage class.
///
/// `resize(0)` frees the buffer; `resize(n>0)` preserves `min(old, n)` words
/// and zero-fills growth — enforced uniformly here rather than duplicated in
/// every implementor.
pub trait ArrayT {
    fn is_local(&self) -> bool {
        false
    }
    fn get(&self, index: u64) -> Option<u64>;
    fn set(&self, index: u64, value: u64) -> bool;
    fn size(&self) -> u64;
    fn resize(&self, size: u64);
}

pub type ArrayHandle = Rc<dyn ArrayT>;

fn resize_vec(buf: &mut Vec<u64>, size: u64) {
    buf.resize(size as usize, 0);
}

struct GlobalArray {
    data: RefCell<Vec<u64>>,
}

impl ArrayT for GlobalArray {
    fn get(&self, index: u64) -> Option<u64> {
        self.data.borrow().get(index as usize).copied()
    }
    fn set(&self, index: u64, value: u64) -> bool {
        let mut data = self.data.borrow_mut();
        match data.get_mut(index as usize) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }
    fn size(&self) -> u64 {
        self.data.borrow().len() as u64
    }
    fn resize(&self, size: u64) {
        resize_vec(&mut self.data.borrow_mut(), size);
    }
}

/// A local array's `{size, data}` record, living inside the owning
/// subroutine's per-frame storage.
type LocalFrame = Rc<RefCell<Vec<RefCell<Vec<u64>>>>>;

struct LocalArray {
    storage: LocalFrame,
    offset: usize,
}

impl ArrayT for LocalArray {
    fn is_local(&self) -> bool {
        true
    }
    fn get(&self, index: u64) -> Option<u64> {
        self.storage.borrow()[self.offset]
            .borrow()
            .get(index as usize)
            .copied()
    }
    fn set(&self, index: u64, value: u64) -> bool {
        let frame = self.storage.borrow();
        let mut data = frame[self.offset].borrow_mut();
        match data.get_mut(index as usize) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }
    fn size(&self) -> u64 {
        self.storage.borrow()[self.offset].borrow().len() as u64
    }
    fn resize(&self, size: u64) {
        resize_vec(&mut self.storage.borrow()[self.offset].borrow_mut(), size);
    }
}

struct DelegateArray {
    target: ArrayHandle,
}

impl ArrayT for DelegateArray {
    fn get(&self, index: u64) -> Option<u64> {
        self.target.get(index)
    }
    fn set(&self, index: u64, value: u64) -> bool {
        self.target.set(index, value)
    }
    fn size(&self) -> u64 {
        self.target.size()
    }
    fn resize(&self, size: u64) {
        self.target.resize(size);
    }
}

/// A by-reference array parameter: holds a stack of bindings to sibling
/// arrays, pushed on call and popped on return, so recursive calls nest
/// correctly.
pub struct RefArray {
    stack: RefCell<Vec<ArrayHandle>>,
}

impl RefArray {
    fn new() -> Self {
        Self {
            stack: RefCell::new(Vec::new()),
        }
    }

    pub fn push_ref(&self, target: ArrayHandle) {
        self.stack.borrow_mut().push(target);
    }

    pub fn pop_ref(&self) {
        self.stack.borrow_mut().pop();
    }

    fn current(&self) -> ArrayHandle {
        self.stack
            .borrow()
            .last()
            .cloned()
            .expect("ref-array accessed with no bound target")
    }
}

impl ArrayT for RefArray {
    fn get(&self, index: u64) -> Option<u64> {
        self.current().get(index)
    }
    fn set(&self, index: u64, value: u64) -> bool {
        self.current().set(index, value)
    }
    fn size(&self) -> u64 {
        self.current().size()
    }
    fn resize(&self, size: u64) {
        self.current().resize(size)
    }
}

/// Name→slot mapping for arrays, mirroring [`crate::storage::var::VarManager`].
pub struct ArrayManager {
    arrays: BTreeMap<String, ArrayHandle>,
    storage: LocalFrame,
    storage_size: usize,
    stack: Vec<Vec<RefCell<Vec<u64>>>>,
}

impl Default for ArrayManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ArrayManager {
    /// A bare array handle with no name binding, for builtins that synthesize
    /// a fresh result (e.g. `strcat`) rather than writing into a caller's array.
    pub fn fresh_handle() -> ArrayHandle {
        Rc::new(GlobalArray {
            data: RefCell::new(Vec::new()),
        })
    }

    pub fn new() -> Self {
        Self {
            arrays: BTreeMap::new(),
            storage: Rc::new(RefCell::new(Vec::new())),
            storage_size: 0,
            stack: Vec::new(),
        }
    }

    pub fn alloc_global(&mut self, name: &str) -> Option<ArrayHandle> {
        if let Some(existing) = self.arrays.get(name) {
            return Some(existing.clone());
        }
        let handle: ArrayHandle = Rc::new(GlobalArray {
            data: RefCell::new(Vec::new()),
        });
        self.arrays.insert(name.to_string(), handle.clone());
        Some(handle)
    }

    pub fn alloc_delegate(&mut self, name: &str, target: ArrayHandle) -> Option<ArrayHandle> {
        if self.arrays.contains_key(name) {
            return None;
        }
        let handle: ArrayHandle = Rc::new(DelegateArray { target });
        self.arrays.insert(name.to_string(), handle.clone());
        Some(handle)
    }

    pub fn alloc_ref(&mut self, name: &str) -> Option<Rc<RefArray>> {
        if self.arrays.contains_key(name) {
            return None;
        }
        let handle = Rc::new(RefArray::new());
        self.arrays.insert(name.to_string(), handle.clone());
        Some(handle)
    }

    pub fn alloc_local(&mut self, name: &str) -> Option<ArrayHandle> {
        if let Some(existing) = self.arrays.get(name) {
            return Some(existing.clone());
        }
        let offset = self.storage_size;
        self.storage_size += 1;
        if self.storage.borrow().len() <= offset {
            self.storage
                .borrow_mut()
                .resize_with(self.storage_size, || RefCell::new(Vec::new()));
        }
        let handle: ArrayHandle = Rc::new(LocalArray {
            storage: self.storage.clone(),
            offset,
        });
        self.arrays.insert(name.to_string(), handle.clone());
        Some(handle)
    }

    pub fn get(&self, name: &str) -> Option<ArrayHandle> {
        self.arrays.get(name).cloned()
    }

    pub fn get_autocompletion(&self, prefix: &str) -> Vec<String> {
        self.arrays
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn push(&mut self) {
        if self.storage_size > 0 {
            let mut fresh = Vec::with_capacity(self.storage_size);
            fresh.resize_with(self.storage_size, || RefCell::new(Vec::new()));
            let saved = std::mem::replace(&mut *self.storage.borrow_mut(), fresh);
            self.stack.push(saved);
        }
    }

    /// Pops the active frame, releasing every buffer it held.
    pub fn pop(&mut self) {
        if let Some(prev) = self.stack.pop() {
            // Dropping the replaced Vec releases every RefCell<Vec<u64>> in
            // it, which frees the backing buffers.
            *self.storage.borrow_mut() = prev;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_preserves_prefix_and_zero_fills() {
        let mut mgr = ArrayManager::new();
        let a = mgr.alloc_global("a").unwrap();
        a.resize(5);
        for i in 0..5 {
            a.set(i, i + 1);
        }
        a.resize(3);
        assert_eq!(a.size(), 3);
        assert_eq!(a.get(0), Some(1));
        assert_eq!(a.get(2), Some(3));

        a.resize(5);
        assert_eq!(a.size(), 5);
        assert_eq!(a.get(3), Some(0));
        assert_eq!(a.get(4), Some(0));
    }

    #[test]
    fn out_of_bounds_access_is_none() {
        let mut mgr = ArrayManager::new();
        let a = mgr.alloc_global("a").unwrap();
        a.resize(2);
        assert_eq!(a.get(5), None);
        assert!(!a.set(5, 1));
    }

    #[test]
    fn local_frame_swaps_on_push_pop() {
        let mut mgr = ArrayManager::new();
        let a = mgr.alloc_local("a").unwrap();
        a.resize(2);
        a.set(0, 11);
        mgr.push();
        assert_eq!(a.size(), 0);
        a.resize(1);
        a.set(0, 22);
        mgr.pop();
        assert_eq!(a.size(), 2);
        assert_eq!(a.get(0), Some(11));
    }

    #[test]
    fn ref_array_stacks_bindings() {
        let mut mgr = ArrayManager::new();
        let target1 = mgr.alloc_global("t1").unwrap();
        target1.resize(1);
        target1.set(0, 100);
        let target2 = mgr.alloc_global("t2").unwrap();
        target2.resize(1);
        target2.set(0, 200);

        let r = mgr.alloc_ref("r").unwrap();
        r.push_ref(target1.clone());
        assert_eq!(r.get(0), Some(100));
        r.push_ref(target2.clone());
        assert_eq!(r.get(0), Some(200));
        r.pop_ref();
        assert_eq!(r.get(0), Some(100));
    }
}
