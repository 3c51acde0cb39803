// Purpose: Environment impersonation module root: fact table, versions, provider, scope, cache.
// Inputs/Outputs: Re-exports the types the orchestrator needs to impersonate one target.
// Invariants: Nothing here touches process-global state; impersonation is an injected value.
// Gotchas: Host facts come from the configured interpreter, not from this binary's build target.

pub mod depcache;
pub mod facts;
pub mod host;
pub mod platform;
pub mod scope;
pub mod version;

pub use depcache::{DependencyCache, DependencyCacheRedirector};
pub use facts::{Fact, FactEnvironment, FactValue};
pub use host::HostFacts;
pub use platform::Platform;
pub use scope::{ActiveScope, ImpersonationMock, ImpersonationScope};
pub use version::InterpreterVersion;
