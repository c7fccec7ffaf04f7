pub mod breaker;
pub mod config;
pub mod error;
pub mod gateway;
pub mod kernel;
pub mod lifecycle;
pub mod module;
pub mod pool;
pub mod provider;
pub mod time;
pub mod transport;
mod worker;

pub use breaker::{CircuitBreaker, CircuitState};
pub use config::{KernelConfig, TimeConfig, TimeMode};
pub use error::{HostError, Result};
pub use gateway::{EntityLifecycleStatus, NetworkGateway, PendingNetworkAck};
pub use kernel::Kernel;
pub use lifecycle::{
    ConstructionAck, ConstructionOrder, DestructionAck, DestructionOrder, EntityLifecycleModule,
    LifecycleHandle,
};
pub use module::{
    ExecutionMode, ExecutionPolicy, Module, ModuleId, ModuleStats, SnapshotStrategy,
    SystemRegistry,
};
pub use pool::{ReplicaHandle, SnapshotPool};
pub use provider::{
    DirectProvider, DoubleBufferProvider, OnDemandProvider, ProviderKind, SharedProvider,
    SnapshotProvider, SnapshotRef,
};
pub use time::{
    FrameAck, FrameOrder, MasterContinuousClock, MasterLockstepClock, SlaveContinuousClock,
    SlaveLockstepClock, StandaloneClock, TimeController, TimeStep,
};
pub use transport::{DataReader, DataWriter, NetworkTopology, NodeId, StaticTopology};
