//! Priority tier resolution.
//!
//! Whoever holds the priority bond for a token (or is the protocol reward
//! address) may liquidate as soon as an account turns critical. Everyone else
//! waits out the patrician period.

use alloy::primitives::Address;
use anyhow::Result;
use async_trait::async_trait;
use sentinel_chain::ChainRpc;
use std::sync::Arc;
use tracing::{debug, info};

use crate::model::{PriorityMode, Task};
use crate::queue::TaskHandler;
use crate::repository::Repository;

pub struct PriorityResolver {
    repo: Arc<dyn Repository>,
    rpc: Arc<dyn ChainRpc>,
    /// Account whose priority is checked; usually the signer
    address: Option<Address>,
    additional_delay: u64,
}

impl PriorityResolver {
    pub fn new(
        repo: Arc<dyn Repository>,
        rpc: Arc<dyn ChainRpc>,
        address: Option<Address>,
        additional_delay: u64,
    ) -> Self {
        Self {
            repo,
            rpc,
            address,
            additional_delay,
        }
    }

    /// Resolve and persist the liquidation delay for `token`.
    pub async fn resolve_delay(&self, token: Address) -> Result<u64> {
        let info = self.rpc.priority_info(token).await?;
        let plebeian_delay = info.patrician_period.saturating_add(self.additional_delay);

        let (mode, delay) = match self.address {
            None => (PriorityMode::Plebeian, plebeian_delay),
            Some(me) if info.pic == Some(me) => (PriorityMode::Patrician, 0),
            Some(me) if info.reward_address == me => (PriorityMode::Patrician, 0),
            Some(_) => (PriorityMode::Plebeian, plebeian_delay),
        };

        match self.repo.super_token(token).await? {
            Some(mut row) => {
                if row.priority_mode != mode || row.delay_seconds != delay {
                    info!(token = %token, symbol = %row.symbol, mode = ?mode, delay, "Priority tier changed");
                }
                row.priority_mode = mode;
                row.delay_seconds = delay;
                row.priority_bond_holder = info.pic;
                row.liquidation_period = info.liquidation_period;
                row.patrician_period = info.patrician_period;
                self.repo.upsert_super_token(&row).await?;
            }
            None => debug!(token = %token, "Priority resolved for unregistered token"),
        }

        Ok(delay)
    }
}

#[async_trait]
impl TaskHandler<Task> for PriorityResolver {
    async fn handle(&self, task: &Task) -> Result<()> {
        self.resolve_delay(task.token).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SuperToken;
    use crate::repository::MemoryRepository;
    use crate::test_support::MockRpc;
    use sentinel_chain::PriorityInfo;

    const TOKEN: Address = Address::new([0xaa; 20]);
    const ME: Address = Address::new([0x01; 20]);
    const PIC: Address = Address::new([0x02; 20]);
    const REWARD: Address = Address::new([0x03; 20]);

    async fn setup(address: Option<Address>, pic: Option<Address>) -> (Arc<MemoryRepository>, PriorityResolver) {
        let repo = Arc::new(MemoryRepository::new());
        repo.upsert_super_token(&SuperToken {
            address: TOKEN,
            symbol: "USDCx".into(),
            name: "Super USDC".into(),
            priority_bond_holder: None,
            priority_mode: PriorityMode::Unresolved,
            liquidation_period: 0,
            patrician_period: 0,
            listed: true,
            delay_seconds: 0,
        })
        .await
        .unwrap();

        let rpc = Arc::new(MockRpc::new(5));
        rpc.set_priority(
            TOKEN,
            PriorityInfo {
                pic,
                reward_address: REWARD,
                liquidation_period: 14_400,
                patrician_period: 1_800,
            },
        );
        let resolver = PriorityResolver::new(repo.clone(), rpc, address, 30);
        (repo, resolver)
    }

    #[tokio::test]
    async fn test_no_address_waits_patrician_period() {
        let (repo, resolver) = setup(None, Some(PIC)).await;
        assert_eq!(resolver.resolve_delay(TOKEN).await.unwrap(), 1_830);

        let row = repo.super_token(TOKEN).await.unwrap().unwrap();
        assert_eq!(row.priority_mode, PriorityMode::Plebeian);
        assert_eq!(row.delay_seconds, 1_830);
        assert_eq!(row.priority_bond_holder, Some(PIC));
        assert_eq!(row.patrician_period, 1_800);
    }

    #[tokio::test]
    async fn test_bond_holder_has_no_delay() {
        let (repo, resolver) = setup(Some(ME), Some(ME)).await;
        assert_eq!(resolver.resolve_delay(TOKEN).await.unwrap(), 0);
        let row = repo.super_token(TOKEN).await.unwrap().unwrap();
        assert_eq!(row.priority_mode, PriorityMode::Patrician);
    }

    #[tokio::test]
    async fn test_reward_address_has_no_delay() {
        let (_, resolver) = setup(Some(REWARD), Some(PIC)).await;
        assert_eq!(resolver.resolve_delay(TOKEN).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_anyone_else_waits() {
        let (_, resolver) = setup(Some(ME), None).await;
        assert_eq!(resolver.resolve_delay(TOKEN).await.unwrap(), 1_830);
    }
}
