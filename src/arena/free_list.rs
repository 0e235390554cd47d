/// One contiguous sub-range within a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    offset: u64,
    size: u64,
    occupied: bool,
}

/// Per-block bookkeeping of free and occupied sub-ranges.
///
/// The spans are kept ordered by offset and always partition
/// `[0, capacity)`: no gaps, no overlaps, and never two adjacent free
/// spans. Each span moves Free -> Occupied on reserve and back to Free
/// (possibly merged with its neighbors) on free.
#[derive(Debug)]
pub(crate) struct FreeList {
    spans: Vec<Span>,
}

impl FreeList {
    pub(crate) fn new(capacity: u64) -> Self {
        Self {
            spans: vec![Span {
                offset: 0,
                size: capacity,
                occupied: false,
            }],
        }
    }

    /// Reserve the tightest-fitting free span that can hold `size` bytes.
    ///
    /// Ties between equally-sized candidates break toward the lowest
    /// offset. The chosen span is split into an occupied prefix of exactly
    /// `size` bytes and a free remainder; an exact fit leaves no remainder.
    ///
    /// Returns the offset of the reserved range, or `None` when no free
    /// span is large enough.
    pub(crate) fn reserve_best_fit(&mut self, size: u64) -> Option<u64> {
        debug_assert!(size > 0);

        // min_by_key keeps the first minimum it sees and spans are ordered
        // by offset, so the tie-break falls out of the scan order
        let index = self
            .spans
            .iter()
            .enumerate()
            .filter(|(_, span)| !span.occupied && span.size >= size)
            .min_by_key(|(_, span)| span.size)
            .map(|(index, _)| index)?;

        let chosen = self.spans[index];
        self.spans[index] = Span {
            offset: chosen.offset,
            size,
            occupied: true,
        };
        if chosen.size > size {
            self.spans.insert(
                index + 1,
                Span {
                    offset: chosen.offset + size,
                    size: chosen.size - size,
                    occupied: false,
                },
            );
        }
        Some(chosen.offset)
    }

    /// Return the occupied span starting at `offset` to the free state and
    /// merge it with adjacent free neighbors in both directions.
    ///
    /// Returns the size of the freed range, or `None` when no occupied
    /// span starts at `offset` -- the double-free guard.
    pub(crate) fn free(&mut self, offset: u64) -> Option<u64> {
        let index = self
            .spans
            .binary_search_by_key(&offset, |span| span.offset)
            .ok()?;
        if !self.spans[index].occupied {
            return None;
        }

        self.spans[index].occupied = false;
        let freed = self.spans[index].size;

        // merge forward first so `index` stays valid for the backward merge
        if index + 1 < self.spans.len() && !self.spans[index + 1].occupied {
            self.spans[index].size += self.spans[index + 1].size;
            self.spans.remove(index + 1);
        }
        if index > 0 && !self.spans[index - 1].occupied {
            self.spans[index - 1].size += self.spans[index].size;
            self.spans.remove(index);
        }

        Some(freed)
    }

    /// Total bytes currently free.
    pub(crate) fn free_bytes(&self) -> u64 {
        self.spans
            .iter()
            .filter(|span| !span.occupied)
            .map(|span| span.size)
            .sum()
    }

    /// Size of the largest single free span.
    pub(crate) fn largest_free(&self) -> u64 {
        self.spans
            .iter()
            .filter(|span| !span.occupied)
            .map(|span| span.size)
            .max()
            .unwrap_or(0)
    }
}
