//! Regions of a virtual address space and the ordered list holding them.
//!
//! The list is doubly linked through descriptors handed out by an
//! [`ObjectAllocator`](kernel_alloc::ObjectAllocator). Every mutation takes
//! `&mut RegionList`, so the owning lock is the only way in; the
//! last-searched cache is the one field readers may update.

use crate::{MemoryAllocationOptions, MemoryContent, MemoryRange, VmmError};
use arrayvec::ArrayVec;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};
use kernel_alloc::{PoolProvider, SmpObjectAllocator};
use kernel_vmem::{MemoryFlags, PAGE_SIZE, VirtualAddress};

/// Allocator for region descriptors.
pub type Descriptors<D> = SmpObjectAllocator<RegionNode, D>;

/// One contiguous stretch of a VAS with uniform attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub range: MemoryRange,
    pub flags: MemoryFlags,
    pub options: MemoryAllocationOptions,
    pub content: MemoryContent,
}

impl MemoryRegion {
    #[must_use]
    pub const fn free(range: MemoryRange) -> Self {
        Self {
            range,
            flags: MemoryFlags::empty(),
            options: MemoryAllocationOptions::empty(),
            content: MemoryContent::Free,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_free(&self) -> bool {
        matches!(self.content, MemoryContent::Free)
    }

    /// The range without its guard pages.
    #[must_use]
    pub const fn usable(&self) -> MemoryRange {
        let (low, high) = self.options.guard_pages();
        MemoryRange::new(
            VirtualAddress::new(self.range.start.as_u64() + low as u64 * PAGE_SIZE),
            VirtualAddress::new(self.range.end.as_u64() - high as u64 * PAGE_SIZE),
        )
    }

    /// Whether the page holding `va` is one of the region's guard pages.
    #[must_use]
    pub const fn is_guard_page(&self, va: VirtualAddress) -> bool {
        let page = va.page_base().as_u64();
        (self.options.contains(MemoryAllocationOptions::GUARD_LOW)
            && page < self.range.start.as_u64() + PAGE_SIZE)
            || (self.options.contains(MemoryAllocationOptions::GUARD_HIGH)
                && page >= self.range.end.as_u64() - PAGE_SIZE)
    }

    /// Whether `range` overlaps one of the guard pages.
    #[must_use]
    pub fn touches_guard(&self, range: &MemoryRange) -> bool {
        let usable = self.usable();
        let low = MemoryRange::new(self.range.start, usable.start);
        let high = MemoryRange::new(usable.end, self.range.end);
        low.intersects(range) || high.intersects(range)
    }
}

/// A region descriptor, linked into a [`RegionList`].
#[derive(Clone, Copy)]
pub struct RegionNode {
    region: MemoryRegion,
    prev: Link,
    next: Link,
}

pub(crate) type Link = Option<NonNull<RegionNode>>;

// Links are only followed under the owning list's lock.
unsafe impl Send for RegionNode {}

/// Address-ordered, non-overlapping regions covering a VAS end to end.
pub struct RegionList {
    head: Link,
    /// Lowest free region.
    first_free: Link,
    /// Region the last page fault resolved against.
    last_searched: AtomicPtr<RegionNode>,
    len: usize,
}

// Nodes are only reached through the list, and the list through its lock.
unsafe impl Send for RegionList {}
unsafe impl Sync for RegionList {}

impl RegionList {
    pub(crate) const fn new() -> Self {
        Self {
            head: None,
            first_free: None,
            last_searched: AtomicPtr::new(ptr::null_mut()),
            len: 0,
        }
    }

    /// Seeds the list with one free region spanning `bounds`.
    pub(crate) fn init<D: PoolProvider>(
        &mut self,
        descriptors: &Descriptors<D>,
        bounds: MemoryRange,
    ) -> Result<(), VmmError> {
        debug_assert!(self.head.is_none());
        let node = descriptors.allocate_value(RegionNode {
            region: MemoryRegion::free(bounds),
            prev: None,
            next: None,
        })?;
        self.head = Some(node);
        self.first_free = Some(node);
        self.len = 1;
        Ok(())
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            next: self.head,
            _list: PhantomData,
        }
    }

    pub(crate) const fn head(&self) -> Link {
        self.head
    }

    /// Region at `link` and the link after it.
    pub(crate) fn step(link: Link) -> Option<(MemoryRegion, Link)> {
        let node = Self::node(link?);
        Some((node.region, node.next))
    }

    /// The region containing `va`.
    #[must_use]
    pub fn find(&self, va: VirtualAddress) -> Option<&MemoryRegion> {
        self.find_node(va).map(|n| &Self::node(n).region)
    }

    /// The lowest free region.
    #[must_use]
    pub fn first_free(&self) -> Option<&MemoryRegion> {
        self.first_free.map(|n| &Self::node(n).region)
    }

    /// The cached region if it contains `va`.
    pub(crate) fn last_searched(&self, va: VirtualAddress) -> Option<&MemoryRegion> {
        let node = NonNull::new(self.last_searched.load(Ordering::Acquire))?;
        let region = &Self::node(node).region;
        region.range.contains(va).then_some(region)
    }

    /// Caches the region containing `va` for the next lookup.
    pub(crate) fn remember(&self, va: VirtualAddress) {
        if let Some(node) = self.find_node(va) {
            self.last_searched.store(node.as_ptr(), Ordering::Release);
        }
    }

    #[inline]
    fn node<'a>(n: NonNull<RegionNode>) -> &'a RegionNode {
        // Nodes live as long as they are linked, and the list outlives the borrow.
        unsafe { n.as_ref() }
    }

    #[inline]
    #[allow(clippy::mut_from_ref, clippy::unused_self)]
    fn node_mut(&mut self, mut n: NonNull<RegionNode>) -> &mut RegionNode {
        unsafe { n.as_mut() }
    }

    fn find_node(&self, va: VirtualAddress) -> Link {
        let mut cursor = self.head;
        while let Some(n) = cursor {
            let node = Self::node(n);
            if node.region.range.contains(va) {
                return Some(n);
            }
            if node.region.range.start > va {
                return None;
            }
            cursor = node.next;
        }
        None
    }

    fn next_free_from(&self, from: Link) -> Link {
        let mut cursor = from;
        while let Some(n) = cursor {
            let node = Self::node(n);
            if node.region.is_free() {
                return Some(n);
            }
            cursor = node.next;
        }
        None
    }

    /// Places a region of `pages` usable pages plus its guard pages.
    ///
    /// With a `hint`, the usable part starts exactly there; otherwise the
    /// lowest free region large enough is used. Returns the usable start.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn allocate<D: PoolProvider>(
        &mut self,
        descriptors: &Descriptors<D>,
        bounds: MemoryRange,
        hint: Option<VirtualAddress>,
        pages: usize,
        flags: MemoryFlags,
        options: MemoryAllocationOptions,
        content: MemoryContent,
    ) -> Result<VirtualAddress, VmmError> {
        if pages == 0 || content == MemoryContent::Free {
            return Err(VmmError::ArgumentOutOfRange);
        }
        let (low, high) = options.guard_pages();
        let total = pages + low + high;
        let bytes = (total as u64)
            .checked_mul(PAGE_SIZE)
            .ok_or(VmmError::OutOfVirtualSpace)?;

        let (node, start) = if let Some(addr) = hint {
            if !addr.is_page_aligned() {
                return Err(VmmError::AlignmentFailure);
            }
            let start = addr
                .as_u64()
                .checked_sub(low as u64 * PAGE_SIZE)
                .ok_or(VmmError::ArgumentOutOfRange)?;
            let end = start.checked_add(bytes).ok_or(VmmError::ArgumentOutOfRange)?;
            let want = MemoryRange::new(VirtualAddress::new(start), VirtualAddress::new(end));
            if !bounds.covers(&want) {
                return Err(VmmError::ArgumentOutOfRange);
            }
            let node = self
                .find_node(want.start)
                .ok_or(VmmError::ArgumentOutOfRange)?;
            let region = &Self::node(node).region;
            if !region.is_free() || !region.range.covers(&want) {
                return Err(VmmError::AddressInUse(addr));
            }
            (node, want.start)
        } else {
            let mut cursor = self.first_free;
            loop {
                let n = cursor.ok_or(VmmError::OutOfVirtualSpace)?;
                let node = Self::node(n);
                if node.region.is_free() && node.region.range.size() >= bytes {
                    break (n, node.region.range.start);
                }
                cursor = node.next;
            }
        };

        let want = MemoryRange::from_pages(start, total);
        let node = self.carve(descriptors, node, want)?;
        self.node_mut(node).region = MemoryRegion {
            range: want,
            flags,
            options,
            content,
        };
        if self.first_free == Some(node) {
            self.first_free = self.next_free_from(Some(node));
        }

        log::trace!("region {want:?} allocated for {content:?}");
        Ok(VirtualAddress::new(start.as_u64() + low as u64 * PAGE_SIZE))
    }

    /// Returns `pages` pages at `addr` to the free space.
    ///
    /// Releasing the whole usable part of a region releases its guard pages
    /// too. Returns the range that became free.
    pub(crate) fn free<D: PoolProvider>(
        &mut self,
        descriptors: &Descriptors<D>,
        addr: VirtualAddress,
        pages: usize,
    ) -> Result<MemoryRange, VmmError> {
        self.release(descriptors, addr, pages, true)
    }

    /// Like [`free`](Self::free), optionally also for permanent regions,
    /// which is how a failed commit gives its reservation back.
    pub(crate) fn release<D: PoolProvider>(
        &mut self,
        descriptors: &Descriptors<D>,
        addr: VirtualAddress,
        pages: usize,
        keep_permanent: bool,
    ) -> Result<MemoryRange, VmmError> {
        let (node, region, want) = self.locate_allocated(addr, pages)?;
        if keep_permanent && region.options.contains(MemoryAllocationOptions::PERMANENT) {
            return Err(VmmError::Failed);
        }
        let release = if want == region.usable() {
            region.range
        } else {
            want
        };

        let node = self.carve(descriptors, node, release)?;
        self.node_mut(node).region = MemoryRegion::free(release);
        let node = self.coalesce(descriptors, node);

        let start = Self::node(node).region.range.start;
        if self
            .first_free
            .is_none_or(|f| start < Self::node(f).region.range.start)
        {
            self.first_free = Some(node);
        }

        log::trace!("region {release:?} released");
        Ok(release)
    }

    /// Gives `pages` pages at `addr` new protection flags, splitting the
    /// region where needed. Returns the previous flags.
    pub(crate) fn modify<D: PoolProvider>(
        &mut self,
        descriptors: &Descriptors<D>,
        addr: VirtualAddress,
        pages: usize,
        flags: MemoryFlags,
    ) -> Result<MemoryFlags, VmmError> {
        let (node, region, want) = self.locate_allocated(addr, pages)?;
        let node = self.carve(descriptors, node, want)?;
        self.node_mut(node).region.flags = flags;
        Ok(region.flags)
    }

    fn locate_allocated(
        &self,
        addr: VirtualAddress,
        pages: usize,
    ) -> Result<(NonNull<RegionNode>, MemoryRegion, MemoryRange), VmmError> {
        if !addr.is_page_aligned() {
            return Err(VmmError::AlignmentFailure);
        }
        if pages == 0 {
            return Err(VmmError::ArgumentOutOfRange);
        }
        let node = self.find_node(addr).ok_or(VmmError::ArgumentOutOfRange)?;
        let region = Self::node(node).region;
        let want = MemoryRange::from_pages(addr, pages);
        if region.is_free() || !region.range.covers(&want) {
            return Err(VmmError::ArgumentOutOfRange);
        }
        Ok((node, region, want))
    }

    /// Splits `node` so that `want`, which it must cover, is a node of its own.
    ///
    /// Descriptors are taken up front, so a failure leaves the list untouched.
    /// Guard flags follow the outer edges they belong to.
    fn carve<D: PoolProvider>(
        &mut self,
        descriptors: &Descriptors<D>,
        node: NonNull<RegionNode>,
        want: MemoryRange,
    ) -> Result<NonNull<RegionNode>, VmmError> {
        let range = Self::node(node).region.range;
        debug_assert!(range.covers(&want));
        let cut_low = range.start < want.start;
        let cut_high = want.end < range.end;
        let mut spares = Spares::take(descriptors, usize::from(cut_low) + usize::from(cut_high))?;

        let mut node = node;
        if cut_low {
            let upper = self.split(node, want.start, spares.next()?);
            self.node_mut(node)
                .region
                .options
                .remove(MemoryAllocationOptions::GUARD_HIGH);
            self.node_mut(upper)
                .region
                .options
                .remove(MemoryAllocationOptions::GUARD_LOW);
            node = upper;
        }
        if cut_high {
            let upper = self.split(node, want.end, spares.next()?);
            self.node_mut(node)
                .region
                .options
                .remove(MemoryAllocationOptions::GUARD_HIGH);
            self.node_mut(upper)
                .region
                .options
                .remove(MemoryAllocationOptions::GUARD_LOW);
        }
        Ok(node)
    }

    /// Moves `node`'s part from `at` upwards into `spare`, linked after it.
    fn split(
        &mut self,
        node: NonNull<RegionNode>,
        at: VirtualAddress,
        spare: NonNull<RegionNode>,
    ) -> NonNull<RegionNode> {
        let lower = self.node_mut(node);
        let mut region = lower.region;
        region.range.start = at;
        lower.region.range.end = at;
        let next = lower.next;
        lower.next = Some(spare);

        // The spare slot is uninitialized memory from the descriptor pool.
        unsafe {
            spare.as_ptr().write(RegionNode {
                region,
                prev: Some(node),
                next,
            });
        }
        if let Some(next) = next {
            self.node_mut(next).prev = Some(spare);
        }
        self.len += 1;
        spare
    }

    /// Merges a free `node` with free neighbours; returns the survivor.
    fn coalesce<D: PoolProvider>(
        &mut self,
        descriptors: &Descriptors<D>,
        node: NonNull<RegionNode>,
    ) -> NonNull<RegionNode> {
        let mut node = node;
        if let Some(prev) = Self::node(node).prev
            && Self::node(prev).region.is_free()
        {
            let end = Self::node(node).region.range.end;
            self.node_mut(prev).region.range.end = end;
            self.unlink(descriptors, node);
            node = prev;
        }
        if let Some(next) = Self::node(node).next
            && Self::node(next).region.is_free()
        {
            let end = Self::node(next).region.range.end;
            self.node_mut(node).region.range.end = end;
            self.unlink(descriptors, next);
        }
        node
    }

    fn unlink<D: PoolProvider>(&mut self, descriptors: &Descriptors<D>, victim: NonNull<RegionNode>) {
        let RegionNode { prev, next, .. } = *Self::node(victim);
        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        if let Some(n) = next {
            self.node_mut(n).prev = prev;
        }
        if self.first_free == Some(victim) {
            self.first_free = None;
        }
        let _ = self.last_searched.compare_exchange(
            victim.as_ptr(),
            ptr::null_mut(),
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
        self.len -= 1;

        if let Err(e) = descriptors.deallocate(victim) {
            log::warn!("region descriptor {victim:p} not returned: {e}");
        }
    }

    /// Hands every descriptor back; the list is empty afterwards.
    pub(crate) fn clear<D: PoolProvider>(&mut self, descriptors: &Descriptors<D>) {
        let mut cursor = self.head.take();
        while let Some(n) = cursor {
            cursor = Self::node(n).next;
            if let Err(e) = descriptors.deallocate(n) {
                log::warn!("region descriptor {n:p} not returned: {e}");
            }
        }
        self.first_free = None;
        self.last_searched.store(ptr::null_mut(), Ordering::Release);
        self.len = 0;
    }
}

pub struct Iter<'a> {
    next: Link,
    _list: PhantomData<&'a RegionList>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a MemoryRegion;

    fn next(&mut self) -> Option<Self::Item> {
        let node = RegionList::node(self.next?);
        self.next = node.next;
        Some(&node.region)
    }
}

/// Descriptors taken ahead of a list mutation; unused ones go back on drop.
struct Spares<'d, D: PoolProvider> {
    descriptors: &'d Descriptors<D>,
    nodes: ArrayVec<NonNull<RegionNode>, 2>,
}

impl<'d, D: PoolProvider> Spares<'d, D> {
    fn take(descriptors: &'d Descriptors<D>, count: usize) -> Result<Self, VmmError> {
        let mut spares = Self {
            descriptors,
            nodes: ArrayVec::new(),
        };
        for left in (0..count).rev() {
            let node = descriptors.allocate(left + 1)?;
            spares.nodes.push(node);
        }
        Ok(spares)
    }

    fn next(&mut self) -> Result<NonNull<RegionNode>, VmmError> {
        self.nodes.pop().ok_or(VmmError::Failed)
    }
}

impl<D: PoolProvider> Drop for Spares<'_, D> {
    fn drop(&mut self) {
        for node in self.nodes.drain(..) {
            if let Err(e) = self.descriptors.deallocate(node) {
                log::warn!("spare region descriptor {node:p} not returned: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_alloc::{HeapPoolProvider, PoolReleaseOptions};

    const BASE: u64 = 0x40_0000;

    fn va(page: u64) -> VirtualAddress {
        VirtualAddress::new(BASE + page * PAGE_SIZE)
    }

    fn list(pages: u64) -> (RegionList, Descriptors<HeapPoolProvider>, MemoryRange) {
        let d = Descriptors::new(HeapPoolProvider, PoolReleaseOptions::KeepOne);
        let bounds = MemoryRange::new(va(0), va(pages));
        let mut l = RegionList::new();
        l.init(&d, bounds).unwrap();
        (l, d, bounds)
    }

    fn layout(l: &RegionList) -> Vec<(u64, u64, bool)> {
        l.iter()
            .map(|r| {
                (
                    (r.range.start.as_u64() - BASE) / PAGE_SIZE,
                    (r.range.end.as_u64() - BASE) / PAGE_SIZE,
                    r.is_free(),
                )
            })
            .collect()
    }

    fn alloc(
        l: &mut RegionList,
        d: &Descriptors<HeapPoolProvider>,
        bounds: MemoryRange,
        hint: Option<VirtualAddress>,
        pages: usize,
        options: MemoryAllocationOptions,
    ) -> Result<VirtualAddress, VmmError> {
        l.allocate(
            d,
            bounds,
            hint,
            pages,
            MemoryFlags::WRITABLE,
            options,
            MemoryContent::Generic,
        )
    }

    #[test]
    fn first_fit_splits_the_lowest_free_region() {
        let (mut l, d, b) = list(16);
        let none = MemoryAllocationOptions::empty();
        assert_eq!(alloc(&mut l, &d, b, None, 4, none), Ok(va(0)));
        assert_eq!(alloc(&mut l, &d, b, None, 2, none), Ok(va(4)));
        assert_eq!(layout(&l), [(0, 4, false), (4, 6, false), (6, 16, true)]);
        assert_eq!(l.first_free().map(|r| r.range.start), Some(va(6)));
        assert_eq!(d.live(), 3);
    }

    #[test]
    fn guard_pages_surround_the_usable_part() {
        let (mut l, d, b) = list(16);
        let at = alloc(&mut l, &d, b, None, 2, MemoryAllocationOptions::GUARD_FULL).unwrap();
        assert_eq!(at, va(1));
        let region = *l.find(at).unwrap();
        assert_eq!(region.range, MemoryRange::new(va(0), va(4)));
        assert!(region.is_guard_page(va(0)));
        assert!(region.is_guard_page(va(3) + 0x10));
        assert!(!region.is_guard_page(va(2)));
        assert!(region.touches_guard(&MemoryRange::new(va(2), va(4))));
        assert!(!region.touches_guard(&MemoryRange::new(va(1), va(3))));
    }

    #[test]
    fn hinted_allocation_carves_the_middle() {
        let (mut l, d, b) = list(16);
        let none = MemoryAllocationOptions::empty();
        assert_eq!(alloc(&mut l, &d, b, Some(va(5)), 3, none), Ok(va(5)));
        assert_eq!(layout(&l), [(0, 5, true), (5, 8, false), (8, 16, true)]);
        assert_eq!(
            alloc(&mut l, &d, b, Some(va(7)), 2, none),
            Err(VmmError::AddressInUse(va(7)))
        );
        assert_eq!(
            alloc(&mut l, &d, b, Some(va(15)), 2, none),
            Err(VmmError::ArgumentOutOfRange)
        );
    }

    #[test]
    fn freeing_coalesces_neighbours() {
        let (mut l, d, b) = list(16);
        let none = MemoryAllocationOptions::empty();
        let a = alloc(&mut l, &d, b, None, 2, none).unwrap();
        let m = alloc(&mut l, &d, b, None, 2, none).unwrap();
        let z = alloc(&mut l, &d, b, None, 2, none).unwrap();

        l.free(&d, m, 2).unwrap();
        assert_eq!(l.first_free().map(|r| r.range.start), Some(m));
        l.free(&d, a, 2).unwrap();
        assert_eq!(layout(&l), [(0, 4, true), (4, 6, false), (6, 16, true)]);
        l.free(&d, z, 2).unwrap();
        assert_eq!(layout(&l), [(0, 16, true)]);
        assert_eq!(d.live(), 1);
    }

    #[test]
    fn freeing_the_usable_part_drops_the_guards() {
        let (mut l, d, b) = list(16);
        let at = alloc(&mut l, &d, b, None, 3, MemoryAllocationOptions::GUARD_FULL).unwrap();
        assert_eq!(l.free(&d, at, 3), Ok(MemoryRange::new(va(0), va(5))));
        assert_eq!(layout(&l), [(0, 16, true)]);
    }

    #[test]
    fn partial_free_and_modify_split_regions() {
        let (mut l, d, b) = list(16);
        let at = alloc(&mut l, &d, b, None, 6, MemoryAllocationOptions::GUARD_LOW).unwrap();
        assert_eq!(at, va(1));

        let old = l.modify(&d, va(2), 2, MemoryFlags::EXECUTABLE).unwrap();
        assert_eq!(old, MemoryFlags::WRITABLE);
        assert_eq!(
            layout(&l),
            [(0, 2, false), (2, 4, false), (4, 7, false), (7, 16, true)]
        );
        assert!(l.find(va(0)).unwrap().is_guard_page(va(0)));
        assert!(!l.find(va(4)).unwrap().is_guard_page(va(4)));
        assert_eq!(l.find(va(3)).unwrap().flags, MemoryFlags::EXECUTABLE);

        l.free(&d, va(5), 2).unwrap();
        assert_eq!(
            layout(&l),
            [(0, 2, false), (2, 4, false), (4, 5, false), (5, 16, true)]
        );
    }

    #[test]
    fn bad_requests_leave_the_list_alone() {
        let (mut l, d, b) = list(4);
        let none = MemoryAllocationOptions::empty();
        assert_eq!(alloc(&mut l, &d, b, None, 5, none), Err(VmmError::OutOfVirtualSpace));
        assert_eq!(alloc(&mut l, &d, b, None, 0, none), Err(VmmError::ArgumentOutOfRange));
        assert_eq!(l.free(&d, va(0), 1), Err(VmmError::ArgumentOutOfRange));
        let at = alloc(&mut l, &d, b, None, 1, MemoryAllocationOptions::PERMANENT).unwrap();
        assert_eq!(l.free(&d, at, 1), Err(VmmError::Failed));
        assert_eq!(l.free(&d, at + 1, 1), Err(VmmError::AlignmentFailure));
        assert_eq!(layout(&l), [(0, 1, false), (1, 4, true)]);
    }

    #[test]
    fn cache_forgets_unlinked_regions() {
        let (mut l, d, b) = list(8);
        let none = MemoryAllocationOptions::empty();
        let a = alloc(&mut l, &d, b, None, 2, none).unwrap();
        let z = alloc(&mut l, &d, b, None, 2, none).unwrap();
        l.free(&d, a, 2).unwrap();
        l.remember(z);
        assert_eq!(l.last_searched(z).map(|r| r.range.start), Some(z));
        l.free(&d, z, 2).unwrap();
        assert!(l.last_searched(z).is_none());
        l.clear(&d);
        assert_eq!(d.live(), 0);
    }
}
