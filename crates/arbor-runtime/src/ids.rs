//! Container id allocation.
//!
//! Ids live in a dense space of `1..=4095`; the low ids are reserved for
//! the root and service containers and user containers take the least
//! available id from `4` up.

use arbor_common::constants::{CONTAINER_ID_MAX, FIRST_USER_CONTAINER_ID};
use arbor_common::error::{ArborError, Result};
use arbor_common::types::CtId;

/// Bitmap allocator over the container id space.
#[derive(Debug)]
pub struct IdMap {
    words: Vec<u64>,
}

impl IdMap {
    /// Creates an allocator with the reserved ids already taken.
    #[must_use]
    pub fn new() -> Self {
        let words = vec![0u64; (CONTAINER_ID_MAX as usize + 64) / 64];
        let mut map = Self { words };
        // id 0 does not exist; 1..4 are reserved for service containers
        for id in 0..FIRST_USER_CONTAINER_ID {
            map.mark(id);
        }
        map
    }

    fn mark(&mut self, id: u32) {
        self.words[(id / 64) as usize] |= 1 << (id % 64);
    }

    fn is_taken(&self, id: u32) -> bool {
        self.words[(id / 64) as usize] & (1 << (id % 64)) != 0
    }

    /// Allocates the least available user id.
    ///
    /// # Errors
    ///
    /// Fails with `ResourceNotAvailable` when the id space is exhausted.
    pub fn get(&mut self) -> Result<CtId> {
        for id in FIRST_USER_CONTAINER_ID..=CONTAINER_ID_MAX {
            if !self.is_taken(id) {
                self.mark(id);
                return Ok(CtId(id));
            }
        }
        Err(ArborError::no_resource("container id space exhausted"))
    }

    /// Claims a specific id, used by restore and the service containers.
    ///
    /// # Errors
    ///
    /// Fails when the id is out of range or already taken.
    pub fn get_at(&mut self, id: u32) -> Result<CtId> {
        if id == 0 || id > CONTAINER_ID_MAX {
            return Err(ArborError::invalid_value(format!(
                "container id out of range: {id}"
            )));
        }
        if id >= FIRST_USER_CONTAINER_ID && self.is_taken(id) {
            return Err(ArborError::busy(format!("container id {id} is taken")));
        }
        self.mark(id);
        Ok(CtId(id))
    }

    /// Returns an id to the pool.
    pub fn put(&mut self, id: CtId) {
        if id.0 >= FIRST_USER_CONTAINER_ID && id.0 <= CONTAINER_ID_MAX {
            self.words[(id.0 / 64) as usize] &= !(1 << (id.0 % 64));
        }
    }
}

impl Default for IdMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_user_id_is_four() {
        let mut ids = IdMap::new();
        assert_eq!(ids.get().expect("get").0, 4);
        assert_eq!(ids.get().expect("get").0, 5);
    }

    #[test]
    fn put_makes_id_reusable() {
        let mut ids = IdMap::new();
        let a = ids.get().expect("get");
        let _b = ids.get().expect("get");
        ids.put(a);
        assert_eq!(ids.get().expect("get"), a);
    }

    #[test]
    fn reserved_ids_stay_reserved() {
        let mut ids = IdMap::new();
        ids.put(CtId(1));
        assert_eq!(ids.get().expect("get").0, 4);
    }

    #[test]
    fn get_at_detects_collisions() {
        let mut ids = IdMap::new();
        ids.get_at(100).expect("claim");
        assert!(ids.get_at(100).is_err());
        assert!(ids.get_at(0).is_err());
        assert!(ids.get_at(9999).is_err());
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut ids = IdMap::new();
        for _ in FIRST_USER_CONTAINER_ID..=CONTAINER_ID_MAX {
            ids.get().expect("get");
        }
        assert!(ids.get().is_err());
    }
}
