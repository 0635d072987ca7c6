use crate::seq::Seq;

/// Fixed-capacity storage for per-sequence data, indexed by `seq mod capacity`.
///
/// The sequence space is an unbounded wrapping ring, so an open-ended map would grow with the
///  lifetime of the session. Bounding the storage to the configured window capacity keeps memory
///  proportional to the window instead. Each slot remembers the sequence id it holds so that a
///  slot still occupied by an older, unacknowledged sequence is detected rather than silently
///  overwritten - callers treat that as window backpressure.
pub struct SeqBuffer<T> {
    slots: Vec<Option<(Seq, T)>>,
    len: usize,
}

impl<T> SeqBuffer<T> {
    pub fn new(capacity: usize) -> SeqBuffer<T> {
        assert!(capacity > 0);
        SeqBuffer {
            slots: (0..capacity).map(|_| None).collect(),
            len: 0,
        }
    }

    fn slot_index(&self, seq: Seq) -> usize {
        seq.to_raw() as usize % self.slots.len()
    }

    /// Stores a value for `seq`, replacing a previous value for the same id. Fails (returning the
    ///  value) if the slot is occupied by a different sequence id, i.e. the buffer is full at this
    ///  position.
    pub fn insert(&mut self, seq: Seq, value: T) -> Result<(), T> {
        let index = self.slot_index(seq);
        match &self.slots[index] {
            Some((occupant, _)) if *occupant != seq => Err(value),
            occupied => {
                if occupied.is_none() {
                    self.len += 1;
                }
                self.slots[index] = Some((seq, value));
                Ok(())
            }
        }
    }

    pub fn get(&self, seq: Seq) -> Option<&T> {
        match &self.slots[self.slot_index(seq)] {
            Some((occupant, value)) if *occupant == seq => Some(value),
            _ => None,
        }
    }

    pub fn contains(&self, seq: Seq) -> bool {
        self.get(seq).is_some()
    }

    /// true if the slot that `seq` maps to is taken by a *different* sequence id
    pub fn is_blocked(&self, seq: Seq) -> bool {
        match &self.slots[self.slot_index(seq)] {
            Some((occupant, _)) => *occupant != seq,
            None => false,
        }
    }

    pub fn remove(&mut self, seq: Seq) -> Option<T> {
        let index = self.slot_index(seq);
        match &self.slots[index] {
            Some((occupant, _)) if *occupant == seq => {
                self.len -= 1;
                self.slots[index].take().map(|(_, value)| value)
            }
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.len = 0;
    }
}
