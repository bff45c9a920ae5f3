#![no_main]
use std::sync::OnceLock;

use libfuzzer_sys::fuzz_target;
use quilt_core::{GlobalHeap, HeapConfig, MiniHeapRef};

fn fuzz_heap() -> &'static GlobalHeap {
    static HEAP: OnceLock<GlobalHeap> = OnceLock::new();
    HEAP.get_or_init(|| {
        GlobalHeap::new(HeapConfig {
            arena_bytes: 64 << 20,
            ..HeapConfig::default()
        })
    })
}

fuzz_target!(|data: &[u8]| {
    // Interpret the input as a sequence of alloc/free/compact operations.
    let heap = fuzz_heap();
    let sizes: &[usize] = &[16, 64, 256, 1024, 16384];

    let mut attached: Vec<MiniHeapRef> = Vec::new();
    let mut live: Vec<usize> = Vec::new();

    for chunk in data.chunks(2) {
        let op = chunk[0] % 5;
        let arg = *chunk.get(1).unwrap_or(&0) as usize;

        match op {
            0 => {
                if attached.len() < 8 {
                    attached.push(heap.acquire_miniheap(sizes[arg % sizes.len()]));
                }
            }
            1 => {
                if let Some(mh) = attached.get(arg % attached.len().max(1)) {
                    if let Some(addr) = mh.alloc_slot() {
                        live.push(addr);
                    }
                }
            }
            2 => {
                if !live.is_empty() {
                    let addr = live.swap_remove(arg % live.len());
                    heap.free(addr);
                }
            }
            3 => {
                if !attached.is_empty() {
                    let mh = attached.swap_remove(arg % attached.len());
                    heap.release_miniheap(mh);
                }
            }
            _ => {
                if arg % 16 == 0 {
                    heap.mallctl("mesh.compact", None, None).unwrap();
                }
                if let Some(&addr) = live.last() {
                    assert!(heap.get_size(addr) > 0);
                }
            }
        }
    }

    // Drain everything so iterations stay independent.
    for mh in attached {
        heap.release_miniheap(mh);
    }
    for addr in live {
        heap.free(addr);
    }
    heap.mallctl("mesh.compact", None, None).unwrap();
});
