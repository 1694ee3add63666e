use std::sync::Arc;
use tracing::info;

use crate::adapters::escrow_relayer::EscrowRelayerClient;
use crate::adapters::juno::JunoClient;
use crate::adapters::sandbox::{SandboxEscrow, SandboxRail};
use crate::adapters::traits::{DepositFeed, EscrowContract, StablecoinRail};
use crate::config::{Config, RailMode};
use crate::error::AppResult;

/// The set of external rails the settlement core talks to
#[derive(Clone)]
pub struct RailRegistry {
    pub deposits: Arc<dyn DepositFeed>,
    pub rail: Arc<dyn StablecoinRail>,
    pub escrow: Arc<dyn EscrowContract>,
}

impl RailRegistry {
    pub fn new(
        deposits: Arc<dyn DepositFeed>,
        rail: Arc<dyn StablecoinRail>,
        escrow: Arc<dyn EscrowContract>,
    ) -> Self {
        Self {
            deposits,
            rail,
            escrow,
        }
    }

    /// Picks live or sandbox implementations from `RAIL_MODE`
    pub fn from_config(config: &Config) -> AppResult<Self> {
        match config.rail_mode {
            RailMode::Live => {
                let juno = Arc::new(JunoClient::new(&config.juno)?);
                let escrow = Arc::new(EscrowRelayerClient::new(&config.escrow)?);
                info!("✅ Live rails registered (Juno: {})", config.juno.base_url);
                Ok(Self::new(juno.clone(), juno, escrow))
            }
            RailMode::Sandbox => {
                let rail = Arc::new(SandboxRail::new());
                info!("🧪 Sandbox rails registered");
                Ok(Self::sandbox(rail, Arc::new(SandboxEscrow::new())))
            }
        }
    }

    pub fn sandbox(rail: Arc<SandboxRail>, escrow: Arc<SandboxEscrow>) -> Self {
        Self::new(rail.clone(), rail, escrow)
    }
}
