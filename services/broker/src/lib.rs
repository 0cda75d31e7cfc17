//! Lornu AI Service Broker Library
//!
//! Instance lifecycle control for an Open Service Broker: registry, per
//! service type strategies, Kubernetes-backed provisioning with rollback.

pub mod api;
pub mod catalog;
pub mod controller;
pub mod error;
pub mod provisioner;
pub mod registry;
pub mod saga;
pub mod strategy;
pub mod types;

pub use controller::InstanceLifecycleController;
pub use error::{BrokerError, Result};
pub use provisioner::{KubeProvisioner, ResourceProvisioner, WorkloadTemplate};
pub use strategy::{DatabasePodStrategy, StrategyTable, UserProvidedStrategy};
