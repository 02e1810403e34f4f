//! Suite-scoped resource allocation
//!
//! Port ranges and MSISDNs are handed out by a process-wide pool. Port
//! allocation is exclusive and append-only for the lifetime of one suite run:
//! ranges are never released or reused, so two instances can never observe
//! overlapping ranges.

use serde::{Deserialize, Serialize};

use crate::errors::{HarnessError, Result};

/// First port handed out when the suite config does not override the base.
pub const DEFAULT_PORT_BASE: u16 = 2000;

/// Ports per simulated-radio instance: 2x carrier aggregation with 2x2 MIMO.
pub const PORTS_PER_RADIO: u16 = 4;

/// One allocated port range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortLease {
    pub owner: String,
    pub base: u16,
    pub count: u16,
}

impl PortLease {
    pub fn contains(&self, port: u16) -> bool {
        port >= self.base && u32::from(port) < u32::from(self.base) + u32::from(self.count)
    }
}

/// Suite-wide allocator for port ranges and subscriber MSISDNs.
#[derive(Debug)]
pub struct ResourcePool {
    next_port: u32,
    leases: Vec<PortLease>,
    next_msisdn: u64,
}

impl ResourcePool {
    pub fn new() -> Self {
        Self::with_base_port(DEFAULT_PORT_BASE)
    }

    pub fn with_base_port(base: u16) -> Self {
        ResourcePool {
            next_port: u32::from(base),
            leases: Vec::new(),
            next_msisdn: 1000,
        }
    }

    /// Allocate `count` contiguous ports for `owner` and return the base.
    /// Ranges never overlap and are never reused within one suite run.
    pub fn next_port_range(&mut self, owner: &str, count: u16) -> Result<u16> {
        if count == 0 {
            return Err(HarnessError::Config(format!(
                "zero-sized port range requested by {}",
                owner
            )));
        }
        let base = self.next_port;
        let end = base + u32::from(count) - 1;
        if end > u32::from(u16::MAX) {
            return Err(HarnessError::PortUnavailable(format!(
                "no {} contiguous ports left for {}",
                count, owner
            )));
        }
        self.next_port = end + 1;
        self.leases.push(PortLease {
            owner: owner.to_string(),
            base: base as u16,
            count,
        });
        Ok(base as u16)
    }

    pub fn leases(&self) -> &[PortLease] {
        &self.leases
    }

    /// Next free subscriber MSISDN.
    pub fn next_msisdn(&mut self) -> String {
        let msisdn = self.next_msisdn;
        self.next_msisdn += 1;
        msisdn.to_string()
    }
}

impl Default for ResourcePool {
    fn default() -> Self {
        Self::new()
    }
}

/// No-authentication marker in subscriber records.
pub const AUTH_ALGO_NONE: &str = "none";
pub const AUTH_ALGO_MILENAGE: &str = "milenage";

/// Token the core-network user db uses for milenage.
const AUTH_ALGO_MILENAGE_DB_TOKEN: &str = "mil";

/// One HSS subscriber record. `id` is the position in the owning list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: usize,
    pub imsi: String,
    pub msisdn: String,
    pub auth_algo: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ki: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apn_ipaddr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qci: Option<u64>,
}

/// Caller-facing subscriber parameters; validation happens in
/// [`Subscriber::from_spec`].
#[derive(Debug, Clone, Default)]
pub struct SubscriberSpec {
    pub imsi: String,
    pub msisdn: Option<String>,
    pub auth_algo: Option<String>,
    pub ki: Option<String>,
    pub opc: Option<String>,
    pub apn_ipaddr: Option<String>,
}

impl Subscriber {
    /// Validate a spec and build the record stored in the subscriber list.
    pub fn from_spec(id: usize, spec: SubscriberSpec, msisdn: String) -> Result<Self> {
        let algo = spec
            .auth_algo
            .unwrap_or_else(|| AUTH_ALGO_NONE.to_string());

        if algo != AUTH_ALGO_NONE && spec.ki.is_none() {
            return Err(HarnessError::Config(format!(
                "auth algo {:?} selected but no KI specified",
                algo
            )));
        }

        let algo = if algo == AUTH_ALGO_MILENAGE {
            if spec.opc.is_none() {
                return Err(HarnessError::Config(
                    "auth algo milenage selected but no OPC specified".to_string(),
                ));
            }
            AUTH_ALGO_MILENAGE_DB_TOKEN.to_string()
        } else {
            algo
        };

        Ok(Subscriber {
            id,
            imsi: spec.imsi,
            msisdn,
            auth_algo: algo,
            ki: spec.ki,
            opc: spec.opc,
            apn_ipaddr: spec.apn_ipaddr,
            qci: None,
        })
    }
}
