use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::gear::{Gear, GearFull, NUM_SLOTS, SLOT_MASK};

pub const DEFAULT_GEARS: usize = 4;
pub const DEFAULT_RESOLUTION_MS: u64 = 1;
pub const DEFAULT_SLOT_CAP: usize = 32;
pub const DEFAULT_MAX_PROBES: usize = 8;

/// An entry rides through the wheel with its deadline tick attached.
///
/// Coarse gears bucket whole time windows into one slot, so a drained
/// entry is not necessarily due yet; the deadline decides fire-or-cascade.
struct Entry<T> {
    when_tick: u64,
    value: T,
}

/// Hierarchical tick-bucket timer storage.
///
/// `NUM_GEARS` levels of 64 slots each; gear `g` covers delays up to
/// `64^(g+1)` ticks at a granularity of `64^g` ticks. Occupancy bitmaps
/// let [`poll`](Self::poll) skip dead time and let
/// [`duration_until_next`](Self::duration_until_next) answer without
/// scanning slots. Entries that find every probed slot full fall over into
/// a `BTreeMap` lane, so insertion never fails and never drops a timer.
///
/// Entries never fire before their deadline: a coarse-gear drain re-files
/// the not-yet-due remainder into finer gears (cascade), and gear 0 is
/// exact to the tick. A deadline already in the past is clamped to the
/// next tick, which is what turns a policy returning `next <= prev` into
/// once-per-tick re-fires instead of a hot loop.
///
/// This is single-threaded storage; the engine owns it on the driver
/// thread and all cross-thread coordination lives in the timer state, not
/// here.
pub struct Wheel<
    T,
    const NUM_GEARS: usize = DEFAULT_GEARS,
    const RESOLUTION_MS: u64 = DEFAULT_RESOLUTION_MS,
    const SLOT_CAP: usize = DEFAULT_SLOT_CAP,
    const MAX_PROBES: usize = DEFAULT_MAX_PROBES,
> {
    gears: [Gear<Entry<T>, SLOT_CAP>; NUM_GEARS],
    overflow: BTreeMap<(u64, u32), T>,
    overflow_seq: u32,
    epoch: Instant,
    current_tick: u64,
    next_fire_tick: Option<u64>,
    cascade_buf: Vec<Entry<T>>,
}

impl<
    T,
    const NUM_GEARS: usize,
    const RESOLUTION_MS: u64,
    const SLOT_CAP: usize,
    const MAX_PROBES: usize,
> Wheel<T, NUM_GEARS, RESOLUTION_MS, SLOT_CAP, MAX_PROBES>
{
    pub fn with_epoch(epoch: Instant) -> Self {
        const {
            assert!(NUM_GEARS >= 1, "must have at least one gear");
            assert!(NUM_GEARS <= 10, "more than 10 gears would overflow u64 ticks");
            assert!(RESOLUTION_MS >= 1, "resolution must be at least 1ms");
            assert!(MAX_PROBES >= 1, "must probe at least the target slot");
        }

        Self {
            gears: std::array::from_fn(|_| Gear::new()),
            overflow: BTreeMap::new(),
            overflow_seq: 0,
            epoch,
            current_tick: 0,
            next_fire_tick: None,
            cascade_buf: Vec::new(),
        }
    }

    pub fn new() -> Self {
        Self::with_epoch(Instant::now())
    }

    #[inline]
    pub fn instant_to_tick(&self, when: Instant) -> u64 {
        when.saturating_duration_since(self.epoch).as_millis() as u64 / RESOLUTION_MS
    }

    /// Time until the earliest pending deadline, `None` when empty.
    ///
    /// An overdue wheel answers `Duration::ZERO`.
    #[inline]
    pub fn duration_until_next(&self) -> Option<Duration> {
        self.next_fire_tick.map(|next| {
            let ticks_remaining = next.saturating_sub(self.current_tick);
            Duration::from_millis(ticks_remaining * RESOLUTION_MS)
        })
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.next_fire_tick.is_none()
    }

    pub fn len(&self) -> usize {
        let in_gears: usize = self.gears.iter().map(Gear::len).sum();
        in_gears + self.overflow.len()
    }

    /// Register `value` to come due at `when`. Never fails.
    pub fn insert(&mut self, when: Instant, value: T) {
        let when_tick = self.instant_to_tick(when);
        let entry = Entry { when_tick, value };
        self.insert_entry(self.current_tick, entry);
    }

    /// Advance to `now`, handing every due entry to `on_due`.
    ///
    /// Returns the number of entries fired. Entries fire at or after their
    /// deadline, never before; lateness is bounded by the granularity of
    /// the gear they sat in plus any probe displacement.
    pub fn poll(&mut self, now: Instant, mut on_due: impl FnMut(T)) -> usize {
        let target_tick = self.instant_to_tick(now);
        if target_tick <= self.current_tick {
            return 0;
        }

        // Skip-ahead: nothing can come due before next_fire_tick, so dead
        // ticks are never walked.
        match self.next_fire_tick {
            None => {
                self.current_tick = target_tick;
                return 0;
            }
            Some(nft) if nft > target_tick => {
                self.current_tick = target_tick;
                return 0;
            }
            Some(nft) => {
                if nft > self.current_tick + 1 {
                    self.current_tick = nft - 1;
                }
            }
        }

        let mut fired = 0;
        for tick in (self.current_tick + 1)..=target_tick {
            fired += self.poll_tick(tick, &mut on_due);
        }

        self.current_tick = target_tick;
        fired += self.drain_overflow(&mut on_due);
        self.recompute_next_fire();
        fired
    }

    fn poll_tick(&mut self, tick: u64, on_due: &mut impl FnMut(T)) -> usize {
        let mut fired = 0;
        let mut cascade = std::mem::take(&mut self.cascade_buf);

        for gear_idx in 0..NUM_GEARS {
            // Gear g only rotates on ticks aligned to its granularity
            if gear_idx > 0 {
                let mask = (1u64 << (6 * gear_idx)) - 1;
                if (tick & mask) != 0 {
                    continue;
                }
            }

            let slot = self.slot_for_tick(gear_idx, tick);
            if !self.gears[gear_idx].is_slot_occupied(slot) {
                continue;
            }

            self.gears[gear_idx].drain(slot, |entry| {
                if entry.when_tick <= tick {
                    fired += 1;
                    on_due(entry.value);
                } else {
                    cascade.push(entry);
                }
            });
        }

        // Not-yet-due remainder re-files into finer gears. The remaining
        // delay is strictly below the drained gear's granularity, so this
        // can never land back in the slot just drained.
        for entry in cascade.drain(..) {
            self.insert_entry(tick, entry);
        }
        self.cascade_buf = cascade;

        fired
    }

    fn drain_overflow(&mut self, on_due: &mut impl FnMut(T)) -> usize {
        let mut fired = 0;

        while let Some(entry) = self.overflow.first_entry() {
            let &(when_tick, _) = entry.key();
            if when_tick > self.current_tick {
                break;
            }

            fired += 1;
            on_due(entry.remove());
        }

        fired
    }

    fn insert_entry(&mut self, now_tick: u64, entry: Entry<T>) {
        let delay = entry.when_tick.saturating_sub(now_tick).max(1);

        // A deadline already in the past is clamped to the next tick;
        // fire_at, not the raw deadline, decides the slot.
        let fire_at = now_tick + delay;
        let gear_idx = self.gear_for_delay(delay);
        let target_slot = self.slot_for_tick(gear_idx, fire_at);

        match self.gears[gear_idx].try_push(target_slot, MAX_PROBES, entry) {
            Ok(actual_slot) => {
                let fire_tick = self.visit_tick(now_tick, gear_idx, actual_slot);
                self.note_next_fire(fire_tick);
            }
            Err(GearFull(entry)) => {
                let seq = self.overflow_seq;
                self.overflow_seq = self.overflow_seq.wrapping_add(1);
                self.overflow.insert((fire_at, seq), entry.value);
                self.note_next_fire(fire_at);
            }
        }
    }

    #[inline]
    fn note_next_fire(&mut self, fire_tick: u64) {
        self.next_fire_tick = Some(self.next_fire_tick.map_or(fire_tick, |t| t.min(fire_tick)));
    }

    fn recompute_next_fire(&mut self) {
        self.next_fire_tick = None;

        for gear_idx in 0..NUM_GEARS {
            if let Some(tick) = self.next_fire_in_gear(gear_idx) {
                self.note_next_fire(tick);
            }
        }

        if let Some((&(tick, _), _)) = self.overflow.first_key_value() {
            self.note_next_fire(tick);
        }
    }

    /// Next rotation tick at which gear `gear_idx` has an occupied slot.
    fn next_fire_in_gear(&self, gear_idx: usize) -> Option<u64> {
        let occupied = self.gears[gear_idx].occupied_bitmap();
        if occupied == 0 {
            return None;
        }

        let current_slot = self.slot_for_tick(gear_idx, self.current_tick);

        // Rotate so current_slot + 1 sits at bit 0; trailing_zeros is then
        // the distance to the next occupied slot.
        let rotation = (current_slot as u32 + 1) & 63;
        let rotated = occupied.rotate_right(rotation);
        let distance = rotated.trailing_zeros() as usize;

        let next_slot = (current_slot + 1 + distance) & SLOT_MASK;
        Some(self.visit_tick(self.current_tick, gear_idx, next_slot))
    }

    /// Tick at which gear `gear_idx`'s rotation next visits `slot`,
    /// strictly after `now_tick`. Aligned to the gear's granularity so the
    /// poll walk cannot step over it.
    fn visit_tick(&self, now_tick: u64, gear_idx: usize, slot: usize) -> u64 {
        let shift = 6 * gear_idx;
        let current_slot = ((now_tick >> shift) & 63) as usize;

        let ticks_to_slot = if slot > current_slot {
            slot - current_slot
        } else {
            NUM_SLOTS - current_slot + slot
        };

        ((now_tick >> shift) + ticks_to_slot as u64) << shift
    }

    #[inline]
    fn gear_for_delay(&self, delay: u64) -> usize {
        debug_assert!(delay >= 1);
        let gear = (63 - delay.leading_zeros()) as usize / 6;
        gear.min(NUM_GEARS - 1)
    }

    #[inline]
    fn slot_for_tick(&self, gear_idx: usize, tick: u64) -> usize {
        let shift = 6 * gear_idx;
        ((tick >> shift) & 63) as usize
    }
}

impl<
    T,
    const NUM_GEARS: usize,
    const RESOLUTION_MS: u64,
    const SLOT_CAP: usize,
    const MAX_PROBES: usize,
> Default for Wheel<T, NUM_GEARS, RESOLUTION_MS, SLOT_CAP, MAX_PROBES>
{
    fn default() -> Self {
        Self::new()
    }
}
