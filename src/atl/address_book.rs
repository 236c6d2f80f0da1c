//! Client fabric address vector, §5 ("Client address vector: `fiAddrLock` rwlock").
//!
//! ATL workers resolve a message's embedded client fabric address into the provider's
//! address vector before issuing RDMA against it. Insertion is idempotent and
//! serialized by a single lock so concurrent workers never race the provider's
//! `fi_av_insert`-equivalent.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::FamResult;
use crate::fabric::{FabricAddress, FabricProvider};

pub struct AddressBook<F: FabricProvider> {
    fabric: Arc<F>,
    seen: Mutex<HashSet<Vec<u8>>>,
}

impl<F: FabricProvider> AddressBook<F> {
    pub fn new(fabric: Arc<F>) -> Self {
        Self {
            fabric,
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Resolve `bytes` into a usable [`FabricAddress`], inserting it into the
    /// provider's address vector the first time it is seen.
    pub fn resolve(&self, bytes: &[u8]) -> FamResult<FabricAddress> {
        let addr = FabricAddress(bytes.to_vec());
        let mut seen = self.seen.lock();
        if !seen.contains(bytes) {
            self.fabric.insert_address(&addr)?;
            seen.insert(bytes.to_vec());
        }
        Ok(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::testing::LoopbackFabric;

    #[test]
    fn resolve_inserts_once_per_unique_address() {
        let book = AddressBook::new(Arc::new(LoopbackFabric::new(false)));
        book.resolve(&[1, 2, 3]).unwrap();
        book.resolve(&[1, 2, 3]).unwrap();
        book.resolve(&[4, 5, 6]).unwrap();
        assert_eq!(book.seen.lock().len(), 2);
    }
}
