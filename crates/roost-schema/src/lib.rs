//! Instance data model and configuration for Roost.
//!
//! This crate defines the schema layer shared by every other crate: the
//! `Instance` record with its status vocabulary and transition log, the
//! `ResourceSpec` passed through to the container engine, string newtypes for
//! identifiers, and the TOML `Config` that wires the daemon together.

pub mod config;
pub mod instance;
pub mod resources;
pub mod types;

pub use config::{
    load_config_or_default, parse_config_file, parse_config_str, Config, ConfigError,
    EngineSection, PolicySection, ReconcilerSection, StoreBackend, StoreSection,
};
pub use instance::{
    container_name, validate_instance_name, Instance, InstanceStatus, LifecycleAction,
    RecordError, Transition,
};
pub use resources::{parse_cpus, parse_memory, PortMapping, Protocol, ResourceSpec};
pub use types::{EngineRef, InstanceId, OperatorId};
