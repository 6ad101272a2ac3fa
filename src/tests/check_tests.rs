use super::*;

/// Overwrites the word at the given address.
fn corrupt(addr: usize, word: TagWord) {
    unsafe { *(addr as *mut TagWord) = word }
}

/// Returns the last block of the heap, which is the free rest of the first
/// chunk in all of these tests.
fn last_block<const E: bool>(guard: &AllocatorInitGuard<E>) -> BlockInfo {
    guard.allocator.blocks().last().unwrap()
}

test_both_policies! {
    fn consistent_heap_passes<const E: bool>() {
        let mut guard = AllocatorInitGuard::<E>::with_default_size();
        assert_eq!(guard.allocator.validate(), Ok(HeapStats::default()));

        let a = guard.allocate(100);
        let _b = guard.allocate(200);
        guard.release(a);

        let stats = guard.stats();
        assert_eq!(stats.allocated_blocks, 1);
        assert_eq!(stats.allocated_bytes, asize::<E>(200));
        assert_eq!(stats.free_blocks, 2);
        assert_eq!(stats.free_bytes, CHUNK_SIZE - asize::<E>(200));
        assert!(guard.allocator.check_heap(line!()));
    }

    fn broken_prologue_is_detected<const E: bool>() {
        let mut guard = AllocatorInitGuard::<E>::with_default_size();
        guard.allocate(1);

        corrupt(guard.addr(), TagWord::from_raw(0));
        assert_eq!(
            guard.allocator.validate(),
            Err(HeapCheckError::BadPrologue { found: 0 })
        );
        assert!(!guard.allocator.check_heap(line!()));
    }

    fn broken_epilogue_is_detected<const E: bool>() {
        let mut guard = AllocatorInitGuard::<E>::with_default_size();
        guard.allocate(1);

        let epilogue_addr = guard.allocator.source().upper_bound() - WORD_SIZE;
        corrupt(epilogue_addr, TagWord::from_raw(0));
        assert_eq!(
            guard.allocator.validate(),
            Err(HeapCheckError::BadEpilogue { addr: epilogue_addr })
        );
    }

    fn broken_footer_is_detected<const E: bool>() {
        let mut guard = AllocatorInitGuard::<E>::with_default_size();
        guard.allocate(1);

        let free = last_block(&guard);
        corrupt(free.addr + free.size - WORD_SIZE, TagWord::pack(free.size - 16, false, false));
        assert_eq!(
            guard.allocator.validate(),
            Err(HeapCheckError::FooterMismatch { addr: free.addr })
        );
    }

    fn block_past_the_heap_is_detected<const E: bool>() {
        let mut guard = AllocatorInitGuard::<E>::with_default_size();
        let ptr = guard.allocate(1);

        let block = guard.block_of(ptr);
        let header = unsafe { Block::at(block.addr) }.tag();
        corrupt(block.addr, TagWord::from_raw(header.raw() + 2 * CHUNK_SIZE as u64));
        assert_eq!(
            guard.allocator.validate(),
            Err(HeapCheckError::BlockOutOfBounds { addr: block.addr })
        );
    }

    fn bad_block_size_is_detected<const E: bool>() {
        let mut guard = AllocatorInitGuard::<E>::with_default_size();
        let ptr = guard.allocate(1);

        let block = guard.block_of(ptr);
        let header = unsafe { Block::at(block.addr) }.tag();
        corrupt(
            block.addr,
            TagWord::pack(ALIGNMENT, true, header.is_prev_allocated()),
        );
        assert_eq!(
            guard.allocator.validate(),
            Err(HeapCheckError::BadBlockSize { addr: block.addr, size: ALIGNMENT })
        );
    }

    fn adjacent_free_blocks_are_detected<const E: bool>() {
        let mut guard = AllocatorInitGuard::<E>::with_default_size();
        let ptr = guard.allocate(1);

        // turn the allocated block into a free one that was never merged or linked.
        let block = guard.block_of(ptr);
        let free = TagWord::pack(block.size, false, E);
        corrupt(block.addr, free);
        corrupt(block.addr + block.size - WORD_SIZE, free.mirrored_footer());

        let next = last_block(&guard);
        if E {
            // the next block still believes its predecessor is allocated.
            assert_eq!(
                guard.allocator.validate(),
                Err(HeapCheckError::StalePrevAllocatedFlag { addr: next.addr })
            );
            corrupt(next.addr, TagWord::pack(next.size, false, false));
        }

        assert_eq!(
            guard.allocator.validate(),
            Err(HeapCheckError::AdjacentFreeBlocks { addr: next.addr })
        );
    }

    fn unlinked_free_block_is_detected<const E: bool>() {
        let mut guard = AllocatorInitGuard::<E>::with_default_size();
        guard.allocate(1);

        let free = last_block(&guard);
        unsafe { guard.allocator.bins.remove(FreeBlock::ptr_from_addr(free.addr)) };
        assert_eq!(
            guard.allocator.validate(),
            Err(HeapCheckError::FreeCountMismatch { in_heap: 1, in_free_lists: 0 })
        );
    }

    fn dangling_link_is_detected<const E: bool>() {
        let mut guard = AllocatorInitGuard::<E>::with_default_size();
        guard.allocate(1);

        let free = last_block(&guard);
        let bucket = size_class(free.size);
        unsafe {
            let block = FreeBlock::ptr_from_addr(free.addr);
            (*block.as_ptr()).next = FreeBlock::ptr_from_addr(ALIGNMENT);
        }
        assert_eq!(
            guard.allocator.validate(),
            Err(HeapCheckError::LinkOutOfBounds { bucket, addr: ALIGNMENT })
        );
    }

    fn asymmetric_links_are_detected<const E: bool>() {
        let mut guard = AllocatorInitGuard::<E>::with_default_size();
        let a = guard.allocate(40);
        let _fence_a = guard.allocate(1);
        let b = guard.allocate(40);
        let _fence_b = guard.allocate(1);
        guard.release(a);
        guard.release(b);

        // `b` is the head of the bucket and links to `a` both ways. make `b` link to
        // itself forwards only.
        let b_addr = guard.block_of(b).addr;
        let bucket = size_class(asize::<E>(40));
        unsafe {
            let block = FreeBlock::ptr_from_addr(b_addr);
            (*block.as_ptr()).next = block;
        }
        assert_eq!(
            guard.allocator.validate(),
            Err(HeapCheckError::BrokenLink { bucket, addr: b_addr })
        );
    }

    fn free_block_in_the_wrong_bucket_is_detected<const E: bool>() {
        let mut guard = AllocatorInitGuard::<E>::with_default_size();
        let a = guard.allocate(40);
        let b = guard.allocate(40);
        let fence = guard.allocate(1);
        guard.release(a);

        // grow `a` over the allocated `b` without moving it to the bucket of its
        // new size. the heap walk itself stays consistent.
        let a = guard.block_of(a);
        let b = guard.block_of(b);
        let bucket = size_class(a.size);
        let grown_size = a.size + b.size;
        assert_ne!(size_class(grown_size), bucket);

        let prev_allocated = unsafe { Block::at(a.addr) }.tag().is_prev_allocated();
        let grown = TagWord::pack(grown_size, false, prev_allocated);
        corrupt(a.addr, grown);
        corrupt(a.addr + grown_size - WORD_SIZE, grown.mirrored_footer());

        let fence = guard.block_of(fence);
        corrupt(fence.addr, TagWord::pack(fence.size, true, false));

        assert_eq!(
            guard.allocator.validate(),
            Err(HeapCheckError::WrongBucket {
                bucket,
                addr: a.addr,
                size: grown_size,
            })
        );
    }

    fn allocated_block_in_a_free_list_is_detected<const E: bool>() {
        let mut guard = AllocatorInitGuard::<E>::with_default_size();
        let a = guard.allocate(40);
        let fence = guard.allocate(1);
        guard.release(a);

        // mark `a` as allocated while it is still linked into its bucket.
        let a = guard.block_of(a);
        let prev_allocated = unsafe { Block::at(a.addr) }.tag().is_prev_allocated();
        let used = TagWord::pack(a.size, true, prev_allocated);
        corrupt(a.addr, used);
        corrupt(a.addr + a.size - WORD_SIZE, used.mirrored_footer());

        let fence = guard.block_of(fence);
        corrupt(fence.addr, TagWord::pack(fence.size, true, E));

        assert_eq!(
            guard.allocator.validate(),
            Err(HeapCheckError::AllocatedBlockInFreeList {
                bucket: size_class(a.size),
                addr: a.addr,
            })
        );
    }

    fn free_list_longer_than_the_heap_is_detected<const E: bool>() {
        let mut guard = AllocatorInitGuard::<E>::new(2 * WORD_SIZE + CHUNK_SIZE);
        let ptr = guard.allocate(payload_size::<E>(CHUNK_SIZE));
        assert_eq!(guard.stats().free_blocks, 0);

        // build a circular list of overlapping fake free blocks, 16 bytes apart,
        // inside the payload of the only block. every block's `prev` link is the
        // next block's header, which reads as a free block of a huge size, so all
        // of them pass as members of the last bucket.
        let max_members =
            (guard.allocator.source().upper_bound() - guard.first_block_addr()) / MIN_BLOCK_SIZE;
        let amount = max_members + 1;
        let first = ptr as usize + WORD_SIZE;
        let addr_of = |i: usize| first + (i % amount) * ALIGNMENT;
        let payload_end = ptr as usize + payload_size::<false>(CHUNK_SIZE);
        assert!(addr_of(amount - 1) + core::mem::size_of::<FreeBlock>() <= payload_end);

        corrupt(first, TagWord::pack(1 << 20, false, false));
        unsafe {
            guard.allocator.bins.insert(FreeBlock::ptr_from_addr(first));
            for i in 0..amount {
                let block = FreeBlock::ptr_from_addr(addr_of(i)).as_ptr();
                (*block).next = FreeBlock::ptr_from_addr(addr_of(i + 1));
                (*block).prev = FreeBlock::ptr_from_addr(addr_of(i + amount - 1));
            }
        }

        let bucket = BUCKETS_AMOUNT - 1;
        assert!(size_class_range(bucket).contains(&(first - WORD_SIZE)));
        assert_eq!(
            guard.allocator.validate(),
            Err(HeapCheckError::FreeListCycle { bucket })
        );
    }
}

#[test]
fn errors_describe_the_broken_invariant() {
    let message = std::format!(
        "{}",
        HeapCheckError::FreeCountMismatch {
            in_heap: 3,
            in_free_lists: 2,
        }
    );
    assert_eq!(message, "3 free blocks in the heap but 2 in the free lists");

    let message = std::format!("{}", HeapCheckError::BadEpilogue { addr: 0x1000 });
    assert_eq!(message, "bad epilogue at 0x1000");

    let message = std::format!("{}", HeapCheckError::FreeListCycle { bucket: 15 });
    assert_eq!(message, "bucket 15 never gets back to its head");
}
