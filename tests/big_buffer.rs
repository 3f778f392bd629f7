//! Big Buffer behavior through the public API.

use busprobe_core::mem::{
    BIG_BUFFER_SIZE, BigBuffer, BigBufferRegion, LONG_LIVED_BUFFER_SIZE, Owner,
};

fn fresh_buffer() -> BigBuffer {
    BigBuffer::new(Box::leak(Box::new(BigBufferRegion::new())))
}

#[test]
fn full_cycle_restores_both_windows() {
    let mut buffer = fresh_buffer();
    let a = buffer.alloc_temporary(64 * 1024, 4096, Owner::La).unwrap();
    let b = buffer.alloc_long_lived(4096, 8, Owner::Scope).unwrap();
    let c = buffer.alloc_temporary(1000, 1, Owner::SelfTest).unwrap();

    buffer.free_temporary(c, Owner::SelfTest);
    buffer.free_temporary(a, Owner::La);
    buffer.free_long_lived(b, Owner::Scope);

    assert_eq!(buffer.available_temporary(1), BIG_BUFFER_SIZE);
    assert_eq!(buffer.available_long_lived(1), LONG_LIVED_BUFFER_SIZE);
    buffer.verify_no_temporary_allocations();
}

#[test]
fn fragmentation_blocks_large_allocations_despite_free_space() {
    let mut buffer = fresh_buffer();

    // 31 spacers of 4 KiB and one payload on top fill the region to the
    // table limit.
    let mut spacers = Vec::new();
    for _ in 0..31 {
        spacers.push(buffer.alloc_temporary(4096, 1, Owner::SelfTest).unwrap());
    }
    let payload = buffer.alloc_temporary(384, 1, Owner::SelfTest).unwrap();

    // Free every other spacer: plenty of total free space, all of it in
    // holes below live allocations.
    let mut freed_total = 0usize;
    let mut kept = Vec::new();
    for (index, spacer) in spacers.into_iter().enumerate() {
        if index % 2 == 0 {
            freed_total += spacer.len();
            buffer.free_temporary(spacer, Owner::SelfTest);
        } else {
            kept.push(spacer);
        }
    }
    assert!(freed_total + buffer.available_temporary(1) >= 64 * 1024);

    // No contiguous 64 KiB exists: the allocator never compacts.
    assert!(buffer.alloc_temporary(64 * 1024, 1, Owner::SelfTest).is_none());

    buffer.free_temporary(payload, Owner::SelfTest);
    for spacer in kept {
        buffer.free_temporary(spacer, Owner::SelfTest);
    }
    assert_eq!(buffer.available_temporary(1), BIG_BUFFER_SIZE);
}

#[test]
fn self_test_command_path() {
    let mut buffer = fresh_buffer();
    assert!(busprobe_core::mem::self_test(&mut buffer));
}
