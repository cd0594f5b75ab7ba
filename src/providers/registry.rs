//! Process-owned RPC registry
//!
//! Built once at startup from `EngineConfig`, injected into every component
//! that talks to a chain and shut down on exit. Also owns the per-chain
//! semaphores that cap concurrent RPC work against one endpoint set,
//! independently of how many workers are running.

use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::info;

use crate::core::batch::ChainStateReader;
use crate::models::config::EngineConfig;
use crate::models::errors::{AppError, AppResult, ErrorCode};
use crate::providers::rpc::RpcProvider;

// ============================================
// PER-CHAIN CONCURRENCY LIMITS
// ============================================

/// Per-chain semaphores, cheap to clone
#[derive(Clone, Default)]
pub struct ChainLimits {
    semaphores: Arc<HashMap<u64, Arc<Semaphore>>>,
}

impl ChainLimits {
    pub fn new(limits: impl IntoIterator<Item = (u64, usize)>) -> Self {
        let semaphores = limits
            .into_iter()
            .map(|(chain_id, permits)| (chain_id, Arc::new(Semaphore::new(permits.max(1)))))
            .collect();
        Self {
            semaphores: Arc::new(semaphores),
        }
    }

    /// Wait for a permit on `chain_id`
    pub async fn acquire(&self, chain_id: u64) -> AppResult<OwnedSemaphorePermit> {
        let semaphore = self
            .semaphores
            .get(&chain_id)
            .ok_or_else(|| AppError::unsupported_chain(chain_id))?;
        semaphore.clone().acquire_owned().await.map_err(|_| {
            AppError::endpoint_unavailable(format!("RPC limits for chain {} are shut down", chain_id))
        })
    }

    /// Permits currently free on a chain
    pub fn available(&self, chain_id: u64) -> Option<usize> {
        self.semaphores.get(&chain_id).map(|s| s.available_permits())
    }

    /// Close every semaphore; pending and future acquisitions fail
    pub fn close(&self) {
        for semaphore in self.semaphores.values() {
            semaphore.close();
        }
    }
}

// ============================================
// RPC REGISTRY
// ============================================

/// Multi-chain RPC registry
pub struct RpcRegistry {
    providers: HashMap<u64, RpcProvider>,
    entry_points: HashMap<u64, Address>,
    limits: ChainLimits,
}

impl RpcRegistry {
    /// Create one provider per configured chain
    pub fn from_config(config: &EngineConfig) -> AppResult<Self> {
        let mut providers = HashMap::new();
        let mut entry_points = HashMap::new();

        for (chain_id, chain) in &config.chains {
            let provider = RpcProvider::for_chain(chain, config.timeouts.rpc)?;
            info!(
                "✅ Initialized RPC for {} ({}, {} endpoints)",
                chain.name,
                provider.masked_url(),
                provider.endpoint_count()
            );
            providers.insert(*chain_id, provider);
            entry_points.insert(*chain_id, chain.entry_point);
        }

        let limits = ChainLimits::new(
            config
                .chains
                .iter()
                .map(|(chain_id, chain)| (*chain_id, chain.rpc_concurrency)),
        );

        Ok(Self {
            providers,
            entry_points,
            limits,
        })
    }

    /// Get provider for a chain
    pub fn get(&self, chain_id: u64) -> AppResult<&RpcProvider> {
        self.providers
            .get(&chain_id)
            .ok_or_else(|| AppError::unsupported_chain(chain_id))
    }

    pub fn limits(&self) -> ChainLimits {
        self.limits.clone()
    }

    pub fn is_supported(&self, chain_id: u64) -> bool {
        self.providers.contains_key(&chain_id)
    }

    pub fn chain_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.providers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Stop handing out RPC permits
    pub fn shutdown(&self) {
        info!("🛑 Shutting down RPC registry ({} chains)", self.providers.len());
        self.limits.close();
    }
}

#[async_trait]
impl ChainStateReader for RpcRegistry {
    async fn account_nonce(&self, chain_id: u64, sender: Address) -> AppResult<U256> {
        let entry_point = *self
            .entry_points
            .get(&chain_id)
            .ok_or_else(|| AppError::unsupported_chain(chain_id))?;
        let _permit = self.limits.acquire(chain_id).await?;
        self.get(chain_id)?.get_nonce(entry_point, sender).await
    }

    async fn allowance(
        &self,
        chain_id: u64,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> AppResult<U256> {
        let _permit = self.limits.acquire(chain_id).await?;
        self.get(chain_id)?.allowance(token, owner, spender).await
    }

    async fn gas_price(&self, chain_id: u64) -> AppResult<U256> {
        let _permit = self.limits.acquire(chain_id).await?;
        self.get(chain_id)?
            .gas_price()
            .await
            .map_err(|e| AppError::new(ErrorCode::EndpointUnavailable, format!("gas price: {}", e.message)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_limits_bound_concurrency() {
        let limits = ChainLimits::new([(8453, 2)]);
        let a = limits.acquire(8453).await.unwrap();
        let _b = limits.acquire(8453).await.unwrap();
        assert_eq!(limits.available(8453), Some(0));

        let pending = tokio::time::timeout(std::time::Duration::from_millis(50), limits.acquire(8453)).await;
        assert!(pending.is_err(), "third permit must wait");

        drop(a);
        assert!(limits.acquire(8453).await.is_ok());
    }

    #[tokio::test]
    async fn test_limits_unknown_chain_and_shutdown() {
        let limits = ChainLimits::new([(1, 1)]);
        assert_eq!(limits.acquire(999).await.unwrap_err().code, ErrorCode::UnsupportedChain);

        limits.close();
        assert_eq!(limits.acquire(1).await.unwrap_err().code, ErrorCode::EndpointUnavailable);
    }

    #[test]
    fn test_registry_from_default_config() {
        let registry = RpcRegistry::from_config(&EngineConfig::default()).unwrap();
        assert!(registry.is_supported(1));
        assert!(registry.get(999).is_err());
        assert_eq!(registry.chain_ids().len(), 7);
    }
}
