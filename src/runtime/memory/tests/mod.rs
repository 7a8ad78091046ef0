//! Memory 单元测试
//!
//! 测试域内存的分配、访问边界和释放

use std::sync::Arc;
use std::thread;

use crate::runtime::domain::DomainId;
use crate::runtime::memory::{DomainMemory, MemoryError, RemoteAddr};

#[cfg(test)]
mod domain_memory_tests {
    use super::*;

    #[test]
    fn test_alloc_is_zeroed() {
        let memory = DomainMemory::new();
        let handle = memory.alloc(16).unwrap();
        assert_eq!(handle.len(), 16);
        assert_eq!(memory.read_all(handle).unwrap(), vec![0; 16]);
        assert_eq!(memory.used(), 16);
        assert_eq!(memory.segments(), 1);
    }

    #[test]
    fn test_write_then_read() {
        let memory = DomainMemory::new();
        let handle = memory.alloc(8).unwrap();
        memory.write(handle, 2, &[1, 2, 3]).unwrap();
        assert_eq!(memory.read(handle, 0, 6).unwrap(), vec![0, 0, 1, 2, 3, 0]);
    }

    #[test]
    fn test_out_of_bounds() {
        let memory = DomainMemory::new();
        let handle = memory.alloc(4).unwrap();
        assert!(matches!(
            memory.write(handle, 3, &[1, 2]),
            Err(MemoryError::OutOfBounds { .. })
        ));
        assert!(matches!(
            memory.read(handle, usize::MAX, 2),
            Err(MemoryError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_view_is_relative() {
        let memory = DomainMemory::new();
        let handle = memory.alloc(10).unwrap();
        let view = memory.view(handle, 4, 4).unwrap();
        memory.write(view, 0, &[9, 9]).unwrap();
        assert_eq!(memory.read(handle, 4, 2).unwrap(), vec![9, 9]);
        assert!(memory.view(view, 2, 4).is_err());
    }

    #[test]
    fn test_free() {
        let memory = DomainMemory::new();
        let handle = memory.alloc(10).unwrap();
        let view = memory.view(handle, 1, 2).unwrap();
        assert_eq!(memory.free(view), Err(MemoryError::NotAllocationBase(view)));

        memory.free(handle).unwrap();
        assert_eq!(memory.used(), 0);
        assert_eq!(memory.free(handle), Err(MemoryError::UnknownHandle(handle)));
        assert!(matches!(memory.read_all(handle), Err(MemoryError::UnknownHandle(_))));
    }

    #[test]
    fn test_limit() {
        let memory = DomainMemory::with_limit(Some(10));
        let first = memory.alloc(6).unwrap();
        assert_eq!(
            memory.alloc(6),
            Err(MemoryError::Exhausted {
                limit: 10,
                requested: 6
            })
        );
        memory.free(first).unwrap();
        assert!(memory.alloc(10).is_ok());
    }

    #[test]
    fn test_concurrent_writers() {
        let memory = Arc::new(DomainMemory::new());
        let handle = memory.alloc(64).unwrap();
        let writers: Vec<_> = (0..8u8)
            .map(|i| {
                let memory = memory.clone();
                thread::spawn(move || {
                    let slot = memory.view(handle, i as usize * 8, 8).unwrap();
                    memory.write(slot, 0, &[i; 8]).unwrap();
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        let bytes = memory.read_all(handle).unwrap();
        for i in 0..8u8 {
            assert!(bytes[i as usize * 8..(i as usize + 1) * 8].iter().all(|b| *b == i));
        }
    }

    #[test]
    fn test_remote_addr_display() {
        let memory = DomainMemory::new();
        let handle = memory.alloc(4).unwrap();
        let addr = RemoteAddr::new(DomainId(3), handle);
        assert_eq!(addr.domain(), DomainId(3));
        assert_eq!(addr.len(), 4);
        assert_eq!(addr.to_string(), "seg0[0..4]@Domain(3)");
    }
}
