//! Per-symbol critical sections.
//!
//! Reconciliation and the tracking-scope updater both read-modify-write
//! `system_tracked_qty`; serializing per symbol prevents lost updates when
//! the retry engine or verifier touches the same symbol at the same instant.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry of per-symbol async locks
#[derive(Default)]
pub struct SymbolLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SymbolLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for a symbol, creating it on first use
    pub async fn acquire(&self, symbol: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test]
    async fn test_same_symbol_serializes() {
        let locks = Arc::new(SymbolLocks::new());
        let in_section = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let locks = locks.clone();
            let in_section = in_section.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("ABC").await;
                assert_eq!(in_section.fetch_add(1, Ordering::SeqCst), 0);
                tokio::task::yield_now().await;
                assert_eq!(in_section.fetch_sub(1, Ordering::SeqCst), 1);
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_different_symbols_are_independent() {
        let locks = SymbolLocks::new();
        let _a = locks.acquire("ABC").await;
        // Acquiring a different symbol must not deadlock
        let _b = locks.acquire("XYZ").await;
    }
}
