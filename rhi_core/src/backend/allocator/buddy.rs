use std::num::NonZeroU64;

use rhi_tracing::trace_span;
use slab::Slab;

use super::{Allocator, Region};

/// A binary buddy allocator over a power-of-two sized memory page.
///
/// Requests are rounded up to the next power of two. A freed node is merged with its buddy
/// while the buddy is free, so a page without allocations is a single free root node again.
#[derive(Clone, Debug)]
pub struct BuddyAllocator {
    base: u64,
    nodes: Slab<Node>,
    root: usize,
    /// Nodes left to visit while searching for a free node.
    pending: Vec<usize>,
    used: u64,
}

impl BuddyAllocator {
    pub fn new(page: Region) -> Self {
        assert!(
            page.size().is_power_of_two(),
            "page size {} is not a power of two",
            page.size()
        );

        let mut nodes = Slab::new();
        let root = nodes.insert(Node {
            offset: 0,
            size: page.size(),
            state: NodeState::Free,
            parent: None,
        });

        Self {
            base: page.start(),
            nodes,
            root,
            // At most one right child per level is pending, plus the left child about to be
            // visited.
            pending: Vec::with_capacity(page.size().ilog2() as usize + 1),
            used: 0,
        }
    }

    /// Returns the size of the page.
    pub fn capacity(&self) -> u64 {
        self.nodes[self.root].size
    }

    /// Returns the number of bytes handed out, including rounding.
    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    fn split(&mut self, index: usize) -> usize {
        let Node { offset, size, .. } = self.nodes[index];
        let half = size / 2;

        let left = self.nodes.insert(Node {
            offset,
            size: half,
            state: NodeState::Free,
            parent: Some(index),
        });
        let right = self.nodes.insert(Node {
            offset: offset + half,
            size: half,
            state: NodeState::Free,
            parent: Some(index),
        });

        self.nodes[index].state = NodeState::Split { left, right };
        left
    }

    /// Returns the node that was handed out for `region`.
    fn find(&self, region: Region) -> Option<usize> {
        let offset = region.start().checked_sub(self.base)?;

        let mut index = self.root;
        loop {
            let node = &self.nodes[index];
            if node.offset == offset && node.size == region.size() {
                return Some(index);
            }

            let NodeState::Split { left, right } = node.state else {
                return None;
            };

            index = if offset < node.offset + node.size / 2 {
                left
            } else {
                right
            };
        }
    }
}

impl Allocator for BuddyAllocator {
    fn alloc(&mut self, size: NonZeroU64, align: NonZeroU64) -> Option<Region> {
        let _span = trace_span!("BuddyAllocator::alloc").entered();

        let size = size.checked_next_power_of_two()?.get();
        let align = align.get();
        debug_assert!(align.is_power_of_two());

        self.pending.clear();
        self.pending.push(self.root);

        while let Some(mut index) = self.pending.pop() {
            let node = self.nodes[index];
            if size > node.size || (self.base + node.offset) % align != 0 {
                continue;
            }

            match node.state {
                NodeState::Used => continue,
                NodeState::Split { left, right } => {
                    // Left is visited first to keep small allocations at the start of the page.
                    self.pending.push(right);
                    self.pending.push(left);
                    continue;
                }
                NodeState::Free => (),
            }

            // Halving a free node keeps its offset, so alignment holds all the way down.
            while self.nodes[index].size > size {
                index = self.split(index);
            }

            self.nodes[index].state = NodeState::Used;
            self.used += size;
            return Some(Region::new(self.base + self.nodes[index].offset, size));
        }

        None
    }

    unsafe fn dealloc(&mut self, region: Region) {
        let _span = trace_span!("BuddyAllocator::dealloc").entered();

        let Some(mut index) = self.find(region) else {
            unreachable!("region {:?} was not allocated", region);
        };

        debug_assert!(matches!(self.nodes[index].state, NodeState::Used));
        self.nodes[index].state = NodeState::Free;
        self.used -= region.size();

        while let Some(parent) = self.nodes[index].parent {
            let NodeState::Split { left, right } = self.nodes[parent].state else {
                unreachable!();
            };

            let buddy = if index == left { right } else { left };
            if !matches!(self.nodes[buddy].state, NodeState::Free) {
                break;
            }

            self.nodes.remove(left);
            self.nodes.remove(right);
            self.nodes[parent].state = NodeState::Free;
            index = parent;
        }
    }
}

#[derive(Copy, Clone, Debug)]
struct Node {
    /// Offset relative to the start of the page.
    offset: u64,
    size: u64,
    state: NodeState,
    parent: Option<usize>,
}

#[derive(Copy, Clone, Debug)]
enum NodeState {
    Free,
    Used,
    Split { left: usize, right: usize },
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU64;

    use crate::backend::allocator::{Allocator, Region};

    use super::BuddyAllocator;

    fn alloc(allocator: &mut BuddyAllocator, size: u64, align: u64) -> Option<Region> {
        allocator.alloc(
            NonZeroU64::new(size).unwrap(),
            NonZeroU64::new(align).unwrap(),
        )
    }

    fn assert_disjoint(regions: &[Region]) {
        for (index, lhs) in regions.iter().enumerate() {
            for rhs in &regions[index + 1..] {
                assert!(!lhs.overlaps(rhs), "{:?} overlaps {:?}", lhs, rhs);
            }
        }
    }

    #[test]
    fn rounds_up_to_power_of_two() {
        let mut allocator = BuddyAllocator::new(Region::new(0, 1024));
        let region = alloc(&mut allocator, 200, 1).unwrap();
        assert_eq!(region.size(), 256);
        assert_eq!(allocator.used(), 256);
    }

    #[test]
    fn fills_page_without_overlap() {
        let mut allocator = BuddyAllocator::new(Region::new(0, 64 * 256));

        let regions: Vec<_> = (0..64)
            .map(|_| alloc(&mut allocator, 256, 256).unwrap())
            .collect();
        assert_disjoint(&regions);

        assert_eq!(allocator.used(), allocator.capacity());
        assert!(alloc(&mut allocator, 1, 1).is_none());
    }

    #[test]
    fn freed_holes_are_reused() {
        let mut allocator = BuddyAllocator::new(Region::new(0, 64 * 256));

        let mut regions: Vec<_> = (0..64)
            .map(|_| alloc(&mut allocator, 256, 1).unwrap())
            .collect();

        let freed: Vec<_> = regions.iter().copied().step_by(2).collect();
        regions.retain(|region| !freed.contains(region));
        for region in freed {
            unsafe {
                allocator.dealloc(region);
            }
        }

        for _ in 0..32 {
            regions.push(alloc(&mut allocator, 256, 1).unwrap());
        }
        assert_disjoint(&regions);
    }

    #[test]
    fn empty_page_collapses_to_root() {
        let mut allocator = BuddyAllocator::new(Region::new(0, 1 << 16));

        let regions: Vec<_> = (0..16)
            .map(|i| alloc(&mut allocator, 64 << (i % 4), 64).unwrap())
            .collect();
        for region in regions.into_iter().rev() {
            unsafe {
                allocator.dealloc(region);
            }
        }

        assert!(allocator.is_empty());
        assert_eq!(allocator.nodes.len(), 1);
        assert!(alloc(&mut allocator, 1 << 16, 1).is_some());
    }

    #[test]
    fn alignment_larger_than_size() {
        let mut allocator = BuddyAllocator::new(Region::new(0, 1 << 16));

        for _ in 0..4 {
            alloc(&mut allocator, 16, 16).unwrap();

            let region = alloc(&mut allocator, 256, 4096).unwrap();
            assert_eq!(region.start() % 4096, 0);
        }
    }

    #[test]
    fn regions_are_offset_by_page_start() {
        let mut allocator = BuddyAllocator::new(Region::new(1 << 20, 4096));

        let first = alloc(&mut allocator, 1024, 1024).unwrap();
        let second = alloc(&mut allocator, 1024, 1024).unwrap();
        assert_eq!(first.start(), 1 << 20);
        assert_eq!(second.start(), (1 << 20) + 1024);

        unsafe {
            allocator.dealloc(first);
            allocator.dealloc(second);
        }
        assert!(allocator.is_empty());
    }
}
