//! Bridge to the guest allocator.
//!
//! The guest's `ulight_free` requires the exact size and alignment the
//! block was allocated with. Every block therefore travels as an
//! [`Allocation`] that records all three values and can only be released
//! by handing it back to [`AllocatorBridge::free`].

use crate::error::{HighlightError, Result};
use crate::memory::MemoryView;
use wasmtime::{AsContextMut, TypedFunc};

/// A live block of guest memory.
///
/// Deliberately neither `Clone` nor `Copy`: freeing consumes it, so a block
/// cannot be released twice or with different parameters.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "guest allocations must be returned to AllocatorBridge::free"]
pub struct Allocation {
    address: u32,
    size: u32,
    alignment: u32,
}

impl Allocation {
    /// The empty allocation handed out for zero-size requests.
    const fn empty(alignment: u32) -> Self {
        Self {
            address: 0,
            size: 0,
            alignment,
        }
    }

    /// Guest address of the first byte.
    pub const fn address(&self) -> u32 {
        self.address
    }

    /// Size in bytes.
    pub const fn size(&self) -> u32 {
        self.size
    }

    /// Alignment the block was requested with.
    pub const fn alignment(&self) -> u32 {
        self.alignment
    }

    /// Check if this is a zero-size allocation.
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// Calls `ulight_alloc` and `ulight_free` on behalf of the host.
pub struct AllocatorBridge {
    memory: MemoryView,
    /// `ulight_alloc(size: u32, alignment: u32) -> u32`.
    alloc_fn: TypedFunc<(u32, u32), u32>,
    /// `ulight_free(address: u32, size: u32, alignment: u32)`.
    free_fn: TypedFunc<(u32, u32, u32), ()>,
    live_allocations: usize,
    live_bytes: u64,
}

impl AllocatorBridge {
    /// Create a bridge over the guest's allocator exports.
    pub fn new(
        memory: MemoryView,
        alloc_fn: TypedFunc<(u32, u32), u32>,
        free_fn: TypedFunc<(u32, u32, u32), ()>,
    ) -> Self {
        Self {
            memory,
            alloc_fn,
            free_fn,
            live_allocations: 0,
            live_bytes: 0,
        }
    }

    /// Allocate `size` bytes aligned to `alignment` inside the guest.
    ///
    /// A zero-size request yields an empty allocation at address 0 without
    /// calling into the guest.
    pub fn allocate<S: AsContextMut>(
        &mut self,
        store: &mut S,
        size: u32,
        alignment: u32,
    ) -> Result<Allocation> {
        if size == 0 {
            return Ok(Allocation::empty(alignment));
        }

        let address = self
            .alloc_fn
            .call(&mut *store, (size, alignment))
            .map_err(HighlightError::fault)?;

        if address == 0 {
            return Err(HighlightError::OutOfGuestMemory {
                requested: size,
                alignment,
            });
        }

        self.live_allocations += 1;
        self.live_bytes += u64::from(size);
        tracing::trace!(address, size, alignment, "guest allocation");

        Ok(Allocation {
            address,
            size,
            alignment,
        })
    }

    /// Return an allocation to the guest with its recorded size and alignment.
    pub fn free<S: AsContextMut>(&mut self, store: &mut S, allocation: Allocation) -> Result<()> {
        if allocation.is_empty() {
            return Ok(());
        }

        let Allocation {
            address,
            size,
            alignment,
        } = allocation;

        self.free_fn
            .call(&mut *store, (address, size, alignment))
            .map_err(HighlightError::fault)?;

        self.live_allocations = self.live_allocations.saturating_sub(1);
        self.live_bytes = self.live_bytes.saturating_sub(u64::from(size));
        tracing::trace!(address, size, alignment, "guest free");

        Ok(())
    }

    /// Copy `data` to the start of `allocation`.
    pub fn write_bytes<S: AsContextMut>(
        &self,
        store: &mut S,
        allocation: &Allocation,
        data: &[u8],
    ) -> Result<()> {
        if data.len() > allocation.size as usize {
            return Err(HighlightError::AllocationTooSmall {
                capacity: allocation.size,
                requested: data.len(),
            });
        }
        self.memory.write(store, allocation.address, data)
    }

    /// Zero every byte of `allocation`.
    pub fn zero<S: AsContextMut>(&self, store: &mut S, allocation: &Allocation) -> Result<()> {
        self.write_bytes(store, allocation, &vec![0; allocation.size as usize])
    }

    /// Number of allocations handed out and not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.live_allocations
    }

    /// Total size of allocations handed out and not yet freed.
    pub fn live_bytes(&self) -> u64 {
        self.live_bytes
    }

    /// Get the memory view this bridge writes through.
    pub fn memory(&self) -> &MemoryView {
        &self.memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmtime::{Engine, Instance, Module, Store};

    const BUMP_ALLOCATOR: &str = r#"
        (module
            (memory (export "memory") 1)
            (global $heap (mut i32) (i32.const 1024))
            (global $outstanding (export "outstanding") (mut i32) (i32.const 0))
            (func (export "ulight_alloc") (param $size i32) (param $align i32) (result i32)
                (local $addr i32)
                (if (i32.gt_u (local.get $size) (i32.const 4096))
                    (then (return (i32.const 0))))
                (local.set $addr
                    (i32.and
                        (i32.add (global.get $heap) (i32.sub (local.get $align) (i32.const 1)))
                        (i32.sub (i32.const 0) (local.get $align))))
                (global.set $heap (i32.add (local.get $addr) (local.get $size)))
                (global.set $outstanding (i32.add (global.get $outstanding) (i32.const 1)))
                (local.get $addr))
            (func (export "ulight_free") (param i32 i32 i32)
                (global.set $outstanding (i32.sub (global.get $outstanding) (i32.const 1))))
        )
    "#;

    fn setup() -> (Store<()>, Instance, AllocatorBridge) {
        let engine = Engine::default();
        let wasm = wat::parse_str(BUMP_ALLOCATOR).expect("Failed to parse WAT");
        let module = Module::new(&engine, &wasm).expect("Failed to compile module");
        let mut store = Store::new(&engine, ());
        let instance = Instance::new(&mut store, &module, &[]).expect("Failed to instantiate");

        let memory = instance
            .get_memory(&mut store, "memory")
            .expect("memory export");
        let alloc_fn = instance
            .get_typed_func::<(u32, u32), u32>(&mut store, "ulight_alloc")
            .expect("alloc export");
        let free_fn = instance
            .get_typed_func::<(u32, u32, u32), ()>(&mut store, "ulight_free")
            .expect("free export");

        let bridge = AllocatorBridge::new(MemoryView::new(memory), alloc_fn, free_fn);
        (store, instance, bridge)
    }

    fn outstanding(store: &mut Store<()>, instance: &Instance) -> i32 {
        instance
            .get_global(&mut *store, "outstanding")
            .expect("outstanding global")
            .get(&mut *store)
            .i32()
            .expect("i32 global")
    }

    #[test]
    fn allocate_and_free_balance() {
        let (mut store, instance, mut bridge) = setup();

        let block = bridge.allocate(&mut store, 16, 8).unwrap();
        assert_eq!(block.address() % 8, 0);
        assert_eq!(block.size(), 16);
        assert_eq!(block.alignment(), 8);
        assert_eq!(bridge.live_allocations(), 1);
        assert_eq!(bridge.live_bytes(), 16);
        assert_eq!(outstanding(&mut store, &instance), 1);

        bridge.free(&mut store, block).unwrap();
        assert_eq!(bridge.live_allocations(), 0);
        assert_eq!(bridge.live_bytes(), 0);
        assert_eq!(outstanding(&mut store, &instance), 0);
    }

    #[test]
    fn zero_size_allocation_skips_guest() {
        let (mut store, instance, mut bridge) = setup();

        let block = bridge.allocate(&mut store, 0, 1).unwrap();
        assert!(block.is_empty());
        assert_eq!(block.address(), 0);
        assert_eq!(bridge.live_allocations(), 0);
        assert_eq!(outstanding(&mut store, &instance), 0);

        bridge.free(&mut store, block).unwrap();
        assert_eq!(outstanding(&mut store, &instance), 0);
    }

    #[test]
    fn null_address_is_out_of_memory() {
        let (mut store, _instance, mut bridge) = setup();

        let err = bridge.allocate(&mut store, 8192, 4).unwrap_err();
        assert!(matches!(
            err,
            HighlightError::OutOfGuestMemory {
                requested: 8192,
                alignment: 4
            }
        ));
        assert_eq!(bridge.live_allocations(), 0);
    }

    #[test]
    fn writes_are_bounded_by_the_allocation() {
        let (mut store, _instance, mut bridge) = setup();

        let block = bridge.allocate(&mut store, 4, 1).unwrap();
        bridge.write_bytes(&mut store, &block, b"abcd").unwrap();
        assert_eq!(
            bridge.memory().read(&store, block.address(), 4).unwrap(),
            b"abcd"
        );

        let err = bridge.write_bytes(&mut store, &block, b"abcde").unwrap_err();
        assert!(matches!(
            err,
            HighlightError::AllocationTooSmall {
                capacity: 4,
                requested: 5
            }
        ));

        bridge.zero(&mut store, &block).unwrap();
        assert_eq!(
            bridge.memory().read(&store, block.address(), 4).unwrap(),
            [0, 0, 0, 0]
        );
        bridge.free(&mut store, block).unwrap();
    }

    #[test]
    fn guest_rejects_frees_with_a_different_layout() {
        let mut instance = crate::testing::bound_instance();
        let parts = instance.parts();

        let block = parts.allocator.allocate(parts.store, 16, 8).unwrap();
        let address = block.address();
        let mismatched = Allocation {
            address,
            size: 16,
            alignment: 4,
        };
        let err = parts.allocator.free(parts.store, mismatched).unwrap_err();
        assert!(err.is_fatal());

        let resized = Allocation {
            address,
            size: 8,
            alignment: 8,
        };
        assert!(parts.allocator.free(parts.store, resized).unwrap_err().is_fatal());
    }

    #[test]
    fn guest_accepts_frees_with_the_recorded_layout() {
        let mut instance = crate::testing::bound_instance();
        let parts = instance.parts();

        let first = parts.allocator.allocate(parts.store, 16, 8).unwrap();
        let second = parts.allocator.allocate(parts.store, 3, 1).unwrap();
        parts.allocator.free(parts.store, first).unwrap();
        parts.allocator.free(parts.store, second).unwrap();
        assert_eq!(crate::testing::outstanding(&mut instance), 0);
        assert_eq!(crate::testing::outstanding_bytes(&mut instance), 0);
    }
}
