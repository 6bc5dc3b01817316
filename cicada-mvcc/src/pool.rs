use crate::arena::VersionArena;
use crate::error::Result;
use crate::version::VersionId;

/// Where [`VersionPool::acquire`] found its version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Popped from the executor's pool.
    Reused,
    /// Taken from the shared arena.
    Fresh,
}

/// Per-executor free list of heap versions.
///
/// Owned by exactly one executor, so no synchronization is needed. With
/// reuse disabled, released versions go back to the arena's global list
/// and only the pre-reserved block is served from here.
#[derive(Debug)]
pub struct VersionPool {
    free: Vec<VersionId>,
    reuse: bool,
}

impl VersionPool {
    pub fn new(reuse: bool) -> Self {
        Self {
            free: Vec::new(),
            reuse,
        }
    }

    /// Moves `n` fresh versions from the arena into the pool.
    pub fn reserve(&mut self, arena: &VersionArena, n: usize) -> Result<()> {
        if n > 0 {
            self.free.extend(arena.allocate_block(n)?);
        }
        Ok(())
    }

    pub fn acquire(&mut self, arena: &VersionArena) -> Result<(VersionId, Provenance)> {
        match self.free.pop() {
            Some(id) => Ok((id, Provenance::Reused)),
            None => Ok((arena.allocate()?, Provenance::Fresh)),
        }
    }

    /// Takes back a version no chain references any more.
    pub fn release(&mut self, arena: &VersionArena, id: VersionId) {
        if self.reuse {
            self.free.push(id);
        } else {
            arena.free(id);
        }
    }

    /// Hands every pooled version back to the arena.
    pub fn drain_into(&mut self, arena: &VersionArena) {
        arena.free_many(self.free.drain(..));
    }

    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_versions_come_first() {
        let arena = VersionArena::new(1, 1);
        let mut pool = VersionPool::new(true);
        pool.reserve(&arena, 3).unwrap();
        assert_eq!(pool.len(), 3);

        for _ in 0..3 {
            assert_eq!(pool.acquire(&arena).unwrap().1, Provenance::Reused);
        }
        assert_eq!(pool.acquire(&arena).unwrap().1, Provenance::Fresh);
    }

    #[test]
    fn release_respects_reuse_flag() {
        let arena = VersionArena::new(1, 1);
        let mut reusing = VersionPool::new(true);
        let (id, _) = reusing.acquire(&arena).unwrap();
        reusing.release(&arena, id);
        assert_eq!(reusing.len(), 1);
        assert_eq!(arena.free_len(), 0);

        let mut plain = VersionPool::new(false);
        let (id, _) = plain.acquire(&arena).unwrap();
        plain.release(&arena, id);
        assert!(plain.is_empty());
        assert_eq!(arena.free_len(), 1);
    }

    #[test]
    fn drain_returns_everything() {
        let arena = VersionArena::new(1, 1);
        let mut pool = VersionPool::new(true);
        pool.reserve(&arena, 8).unwrap();
        pool.drain_into(&arena);
        assert!(pool.is_empty());
        assert_eq!(arena.free_len(), 8);
    }
}
