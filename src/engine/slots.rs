use crate::model::*;

// ── Slot Generation ───────────────────────────────────────────────

/// Candidate start times for a booking of `duration` milliseconds.
///
/// Candidates are walked from the start of each open window in `step`
/// increments. A candidate `c` is kept iff `[c, c + duration)` fits inside the
/// window, overlaps no blocking span, and `c >= earliest`. Output is ascending.
pub fn generate_slots(open: &[Span], blocking: &[Span], duration: Ms, step: Ms, earliest: Ms) -> Vec<Ms> {
    if duration <= 0 || step <= 0 {
        return Vec::new();
    }

    let mut sorted = blocking.to_vec();
    sorted.sort_by_key(|s| s.start);
    let blocked = merge_overlapping(&sorted);

    let mut slots = Vec::new();
    for window in open {
        let mut c = window.start;
        while c + duration <= window.end {
            let candidate = Span::new(c, c + duration);
            if c >= earliest && !hits_any(&blocked, &candidate) {
                slots.push(c);
            }
            c += step;
        }
    }
    slots.sort_unstable();
    slots.dedup();
    slots
}

/// `blocked` must be sorted and disjoint.
fn hits_any(blocked: &[Span], candidate: &Span) -> bool {
    let first = blocked.partition_point(|b| b.end <= candidate.start);
    blocked
        .get(first)
        .is_some_and(|b| b.start < candidate.end)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// Remove `to_remove` from `base`. Both inputs sorted by start.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;
    const M: Ms = 60_000;

    fn day() -> Vec<Span> {
        vec![Span::new(8 * H, 18 * H)]
    }

    #[test]
    fn empty_day_yields_every_step() {
        let slots = generate_slots(&day(), &[], 30 * M, 30 * M, 0);
        assert_eq!(slots.len(), 20);
        assert_eq!(slots.first(), Some(&(8 * H)));
        assert_eq!(slots.last(), Some(&(17 * H + 30 * M)));
    }

    #[test]
    fn duration_must_fit_before_close() {
        let slots = generate_slots(&day(), &[], 90 * M, 30 * M, 0);
        assert_eq!(slots.last(), Some(&(16 * H + 30 * M)));
    }

    #[test]
    fn booking_blocks_overlapping_candidates() {
        // Booked 10:00-10:30; a 30-min request on a 15-min grid.
        let blocking = [Span::new(10 * H, 10 * H + 30 * M)];
        let slots = generate_slots(&day(), &blocking, 30 * M, 15 * M, 0);
        assert!(slots.contains(&(9 * H + 30 * M)));
        assert!(!slots.contains(&(9 * H + 45 * M)));
        assert!(!slots.contains(&(10 * H)));
        assert!(!slots.contains(&(10 * H + 15 * M)));
        assert!(slots.contains(&(10 * H + 30 * M)));
    }

    #[test]
    fn adjacent_booking_does_not_block() {
        let blocking = [Span::new(9 * H, 10 * H)];
        let slots = generate_slots(&day(), &blocking, 60 * M, 60 * M, 0);
        assert!(slots.contains(&(8 * H)));
        assert!(slots.contains(&(10 * H)));
        assert!(!slots.contains(&(9 * H)));
    }

    #[test]
    fn lunch_split_windows() {
        let open = [Span::new(8 * H, 12 * H), Span::new(13 * H, 18 * H)];
        let slots = generate_slots(&open, &[], 60 * M, 30 * M, 0);
        assert!(slots.contains(&(11 * H)));
        assert!(!slots.contains(&(11 * H + 30 * M)));
        assert!(!slots.contains(&(12 * H)));
        assert!(!slots.contains(&(12 * H + 30 * M)));
        assert!(slots.contains(&(13 * H)));
    }

    #[test]
    fn earliest_cuts_morning() {
        let slots = generate_slots(&day(), &[], 30 * M, 30 * M, 12 * H + 10 * M);
        assert_eq!(slots.first(), Some(&(12 * H + 30 * M)));
    }

    #[test]
    fn closed_day_is_empty() {
        assert!(generate_slots(&[], &[], 30 * M, 30 * M, 0).is_empty());
    }

    #[test]
    fn zero_duration_is_empty() {
        assert!(generate_slots(&day(), &[], 0, 30 * M, 0).is_empty());
    }

    #[test]
    fn output_is_deterministic_and_ascending() {
        let blocking = [Span::new(14 * H, 15 * H), Span::new(9 * H, 9 * H + 20 * M)];
        let a = generate_slots(&day(), &blocking, 45 * M, 15 * M, 0);
        let b = generate_slots(&day(), &blocking, 45 * M, 15 * M, 0);
        assert_eq!(a, b);
        assert!(a.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn no_slot_overlaps_any_blocking_span() {
        let blocking = [
            Span::new(8 * H + 10 * M, 8 * H + 50 * M),
            Span::new(11 * H, 13 * H),
            Span::new(12 * H, 12 * H + 30 * M),
        ];
        let duration = 40 * M;
        for start in generate_slots(&day(), &blocking, duration, 5 * M, 0) {
            let candidate = Span::new(start, start + duration);
            assert!(blocking.iter().all(|b| !b.overlaps(&candidate)), "slot {start} overlaps");
        }
    }

    #[test]
    fn merge_and_subtract() {
        let merged = merge_overlapping(&[Span::new(0, 10), Span::new(5, 20), Span::new(20, 25), Span::new(30, 40)]);
        assert_eq!(merged, vec![Span::new(0, 25), Span::new(30, 40)]);

        let free = subtract_intervals(&[Span::new(0, 100)], &[Span::new(10, 20), Span::new(50, 60)]);
        assert_eq!(free, vec![Span::new(0, 10), Span::new(20, 50), Span::new(60, 100)]);
    }
}
