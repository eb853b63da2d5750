// Registry library entry point

pub mod internal {
    pub mod ledger {
        pub mod sqlite;
        pub mod store;
    }
    pub mod builder {
        pub mod client;
    }
    pub mod analyzer {
        pub mod client;
    }
    pub mod registry {
        pub mod programs;
    }
    pub mod governance {
        pub mod library;
        pub mod propagation;
    }
    pub mod api;
    pub mod config;
    pub mod identity;
}

// Re-export key types for external use
pub use internal::analyzer::client::{Analysis, Analyzer, HttpAnalyzerClient, VerificationError};
pub use internal::builder::client::{BuildError, BuildParams, Builder, HttpBuilderClient};
pub use internal::governance::library::{
    GovernanceError, LibraryFunction, LibraryGovernance, Participant, ProposalStatus, VoteOutcome,
};
pub use internal::governance::propagation::{
    DownstreamNode, LibraryPropagator, PropagationError, PropagationMode, PropagationReport,
};
pub use internal::identity::{IdentityError, IdentityVerifier, OrgSigner};
pub use internal::ledger::store::{KvStore, Ledger, LedgerError, MemoryStore, TxContext};
pub use internal::registry::programs::{
    ProcessingSpec, ProgramError, ProgramRegistry, ProgramSource, Registration,
};
