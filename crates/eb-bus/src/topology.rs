use eb_common::{ExchangeName, ExchangeSpec};
use tracing::debug;

use crate::transport::BrokerConnection;
use crate::BusError;

/// The fixed set of exchanges every service declares on connect
#[derive(Debug, Clone)]
pub struct ExchangeTopology {
    exchanges: Vec<ExchangeSpec>,
}

impl Default for ExchangeTopology {
    fn default() -> Self {
        Self {
            exchanges: ExchangeName::ALL.iter().map(ExchangeName::spec).collect(),
        }
    }
}

impl ExchangeTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exchanges(&self) -> &[ExchangeSpec] {
        &self.exchanges
    }

    /// Declare every exchange. Identical redeclaration is a no-op on the broker;
    /// a parameter mismatch comes back as `BusError::Declaration` and is not retried.
    pub async fn declare(&self, conn: &dyn BrokerConnection) -> Result<(), BusError> {
        for spec in &self.exchanges {
            conn.declare_exchange(spec).await?;
            debug!(exchange = %spec.name, kind = spec.kind.as_str(), "Exchange declared");
        }
        Ok(())
    }
}
