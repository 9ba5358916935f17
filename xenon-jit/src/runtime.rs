//! Functions called from generated code.
//!
//! Every helper takes the thread state as its first argument and reports failures by raising an
//! exception on it. Generated code checks the exception code after each call that may raise.

use xenon_cpu::{ExceptionCode, ThreadState};

fn load<const N: usize>(thread: *mut ThreadState, addr: u64) -> [u8; N] {
    let thread = unsafe { &mut *thread };
    let mut buf = [0; N];
    let result = thread.processor.memory().read_bytes(addr as u32, &mut buf).map(|()| buf);
    match result {
        Ok(value) => value,
        Err(_) => {
            thread.raise(ExceptionCode::ReadUnmapped, addr as u32 as u64);
            [0; N]
        }
    }
}

macro_rules! load_ty {
    ($name:ident, $ty:ty) => {
        /// Big-endian guest load, zero extended to 64 bits.
        pub extern "sysv64" fn $name(thread: *mut ThreadState, addr: u64) -> u64 {
            <$ty>::from_be_bytes(load(thread, addr)) as u64
        }
    };
}

load_ty!(load8, u8);
load_ty!(load16, u16);
load_ty!(load32, u32);
load_ty!(load64, u64);

fn store<const N: usize>(thread: *mut ThreadState, addr: u64, value: [u8; N]) {
    let thread = unsafe { &mut *thread };
    let result = thread.processor.memory().write_bytes(addr as u32, &value);
    if result.is_err() {
        thread.raise(ExceptionCode::WriteUnmapped, addr as u32 as u64);
    }
}

macro_rules! store_ty {
    ($name:ident, $ty:ty) => {
        pub extern "sysv64" fn $name(thread: *mut ThreadState, addr: u64, value: u64) {
            store(thread, addr, (value as $ty).to_be_bytes())
        }
    };
}

store_ty!(store8, u8);
store_ty!(store16, u16);
store_ty!(store32, u32);
store_ty!(store64, u64);

/// Calls a guest function through the runtime, resolving (and compiling) it if needed.
pub extern "sysv64" fn call(thread: *mut ThreadState, target: u64) {
    let thread = unsafe { &mut *thread };
    let processor = thread.processor.clone();
    processor.call(thread, target as u32);
}

pub extern "sysv64" fn call_extern(thread: *mut ThreadState, index: u64) {
    let thread = unsafe { &mut *thread };
    let processor = thread.processor.clone();
    processor.call_extern(thread, index as u32);
}

pub extern "sysv64" fn debug_break(thread: *mut ThreadState, addr: u64) {
    let thread = unsafe { &mut *thread };
    let processor = thread.processor.clone();
    processor.debug_break(thread, addr as u32);
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use xenon_cpu::{FlatMemory, Memory, Processor};

    use super::*;

    struct TestProcessor {
        memory: FlatMemory,
    }

    impl Processor for TestProcessor {
        fn memory(&self) -> &dyn Memory {
            &self.memory
        }

        fn call(&self, thread: &mut ThreadState, address: u32) {
            thread.ctx.r[3] = address as u64;
        }

        fn call_extern(&self, thread: &mut ThreadState, index: u32) {
            thread.ctx.r[4] = index as u64;
        }

        fn debug_break(&self, thread: &mut ThreadState, address: u32) {
            thread.raise(ExceptionCode::Breakpoint, address as u64);
        }
    }

    fn thread() -> ThreadState {
        let processor = Arc::new(TestProcessor { memory: FlatMemory::new(0x1000, 0x100) });
        ThreadState::new(processor, 0)
    }

    #[test]
    fn memory_helpers_are_big_endian() {
        let mut thread = thread();
        store32(&mut thread, 0x1000, 0xaabb_ccdd_1122_3344);
        assert_eq!(load8(&mut thread, 0x1000), 0x11);
        assert_eq!(load16(&mut thread, 0x1002), 0x3344);
        assert_eq!(load32(&mut thread, 0x1000), 0x1122_3344);
        assert!(thread.exception.is_none());
    }

    #[test]
    fn unmapped_accesses_raise() {
        let mut thread = thread();
        assert_eq!(load64(&mut thread, 0x2000), 0);
        assert_eq!(thread.exception.kind(), ExceptionCode::ReadUnmapped);
        assert_eq!(thread.exception.value, 0x2000);

        thread.take_exception();
        store16(&mut thread, 0x10ff, 1);
        assert_eq!(thread.exception.kind(), ExceptionCode::WriteUnmapped);
    }

    #[test]
    fn processor_callbacks() {
        let mut thread = thread();
        call(&mut thread, 0x8200_0010);
        call_extern(&mut thread, 7);
        assert_eq!(thread.ctx.r[3], 0x8200_0010);
        assert_eq!(thread.ctx.r[4], 7);

        debug_break(&mut thread, 0x8200_0020);
        assert_eq!(thread.exception.kind(), ExceptionCode::Breakpoint);
    }
}
