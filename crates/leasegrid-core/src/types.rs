//! Shared types used across leasegrid crates.
//!
//! Identifiers for orders and leases, the resource units an order asks
//! for, and the per-class totals the inventory tracker commits against.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

// ── Identifiers ────────────────────────────────────────────────────

/// Identifies a tenant's on-chain order. Immutable and unique per order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderId {
    pub owner: String,
    pub dseq: u64,
    pub gseq: u32,
    pub oseq: u32,
}

impl OrderId {
    pub fn new(owner: impl Into<String>, dseq: u64, gseq: u32, oseq: u32) -> Self {
        Self {
            owner: owner.into(),
            dseq,
            gseq,
            oseq,
        }
    }

    /// The lease this order becomes once `provider` wins the bid.
    pub fn lease(&self, provider: impl Into<String>) -> LeaseId {
        LeaseId {
            order: self.clone(),
            provider: provider.into(),
        }
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.owner, self.dseq, self.gseq, self.oseq)
    }
}

/// An accepted bid: the order plus the provider serving it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LeaseId {
    pub order: OrderId,
    pub provider: String,
}

impl LeaseId {
    pub fn owner(&self) -> &str {
        &self.order.owner
    }

    pub fn order_id(&self) -> &OrderId {
        &self.order
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.order, self.provider)
    }
}

// ── Resources ──────────────────────────────────────────────────────

/// How an exposed service endpoint is reached from outside the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    /// Ingress routed by hostname.
    SharedHttp,
    /// Node port picked by the cluster.
    RandomPort,
    /// Externally routable IP leased to the tenant.
    LeasedIp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub kind: EndpointKind,
    /// Endpoints of the same kind with equal sequence numbers are the same
    /// endpoint (e.g. two services sharing one leased IP).
    #[serde(default)]
    pub sequence_number: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageVolume {
    pub name: String,
    pub bytes: u64,
}

/// One replica shape requested by an order, repeated `count` times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUnit {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    #[serde(default)]
    pub storage: Vec<StorageVolume>,
    #[serde(default)]
    pub gpu_units: u64,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    pub count: u32,
}

/// The full set of resources requested by one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGroup {
    pub name: String,
    pub resources: Vec<ResourceUnit>,
}

impl ResourceGroup {
    /// Number of distinct endpoints of `kind` across every unit.
    pub fn endpoint_quantity(&self, kind: EndpointKind) -> u32 {
        let distinct: BTreeSet<u32> = self
            .resources
            .iter()
            .flat_map(|unit| unit.endpoints.iter())
            .filter(|ep| ep.kind == kind)
            .map(|ep| ep.sequence_number)
            .collect();
        distinct.len() as u32
    }

    /// Aggregate demand per resource class.
    ///
    /// Overflow saturates, which the inventory reads as "does not fit".
    pub fn totals(&self) -> ResourceTotals {
        let mut totals = ResourceTotals::default();
        for unit in &self.resources {
            let count = u64::from(unit.count);
            let storage = unit
                .storage
                .iter()
                .fold(0u64, |acc, v| acc.saturating_add(v.bytes));
            totals.cpu_millis = totals
                .cpu_millis
                .saturating_add(unit.cpu_millis.saturating_mul(count));
            totals.memory_bytes = totals
                .memory_bytes
                .saturating_add(unit.memory_bytes.saturating_mul(count));
            totals.storage_bytes = totals
                .storage_bytes
                .saturating_add(storage.saturating_mul(count));
            totals.gpu_units = totals
                .gpu_units
                .saturating_add(unit.gpu_units.saturating_mul(count));
        }
        totals.endpoints = u64::from(self.endpoint_quantity(EndpointKind::LeasedIp));
        totals
    }
}

/// Resource classes the inventory tracks independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    Cpu,
    Memory,
    Storage,
    Gpu,
    Endpoints,
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceClass::Cpu => "cpu",
            ResourceClass::Memory => "memory",
            ResourceClass::Storage => "storage",
            ResourceClass::Gpu => "gpu",
            ResourceClass::Endpoints => "endpoints",
        };
        f.write_str(name)
    }
}

/// Quantities per resource class. Used for capacity, committed and
/// requested amounts alike.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTotals {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    pub storage_bytes: u64,
    pub gpu_units: u64,
    pub endpoints: u64,
}

impl ResourceTotals {
    fn pairs(&self) -> [(ResourceClass, u64); 5] {
        [
            (ResourceClass::Cpu, self.cpu_millis),
            (ResourceClass::Memory, self.memory_bytes),
            (ResourceClass::Storage, self.storage_bytes),
            (ResourceClass::Gpu, self.gpu_units),
            (ResourceClass::Endpoints, self.endpoints),
        ]
    }

    pub fn is_zero(&self) -> bool {
        self.pairs().iter().all(|(_, v)| *v == 0)
    }

    /// Element-wise sum, `None` if any class overflows.
    pub fn checked_add(&self, other: &Self) -> Option<Self> {
        Some(Self {
            cpu_millis: self.cpu_millis.checked_add(other.cpu_millis)?,
            memory_bytes: self.memory_bytes.checked_add(other.memory_bytes)?,
            storage_bytes: self.storage_bytes.checked_add(other.storage_bytes)?,
            gpu_units: self.gpu_units.checked_add(other.gpu_units)?,
            endpoints: self.endpoints.checked_add(other.endpoints)?,
        })
    }

    pub fn saturating_sub(&self, other: &Self) -> Self {
        Self {
            cpu_millis: self.cpu_millis.saturating_sub(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
            storage_bytes: self.storage_bytes.saturating_sub(other.storage_bytes),
            gpu_units: self.gpu_units.saturating_sub(other.gpu_units),
            endpoints: self.endpoints.saturating_sub(other.endpoints),
        }
    }

    /// First class in which `self` is larger than `limit`, if any.
    pub fn exceeding_class(&self, limit: &Self) -> Option<ResourceClass> {
        self.pairs()
            .into_iter()
            .zip(limit.pairs())
            .find(|((_, want), (_, have))| want > have)
            .map(|((class, _), _)| class)
    }

    pub fn fits_within(&self, limit: &Self) -> bool {
        self.exceeding_class(limit).is_none()
    }
}

/// One row of the reservation snapshot exposed to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationSummary {
    pub order: OrderId,
    pub allocated: bool,
    pub ips_confirmed: bool,
    pub endpoint_quantity: u32,
}
