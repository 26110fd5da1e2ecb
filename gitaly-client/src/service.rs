use crate::config::ConfigError;
use std::fmt;
use std::str::FromStr;

/// Services reachable through the client, resolved at compile time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Service {
    BlobService,
    CleanupService,
    CommitService,
    ConflictsService,
    DiffService,
    HealthCheck,
    ObjectPoolService,
    OperationService,
    RefService,
    RemoteService,
    RepositoryService,
    ServerService,
    SmartHttpService,
    SshService,
}

const ALL_SERVICES: &[Service] = &[
    Service::BlobService,
    Service::CleanupService,
    Service::CommitService,
    Service::ConflictsService,
    Service::DiffService,
    Service::HealthCheck,
    Service::ObjectPoolService,
    Service::OperationService,
    Service::RefService,
    Service::RemoteService,
    Service::RepositoryService,
    Service::ServerService,
    Service::SmartHttpService,
    Service::SshService,
];

impl Service {
    /// The snake case name used in call details, metrics and error metadata.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Service::BlobService => "blob_service",
            Service::CleanupService => "cleanup_service",
            Service::CommitService => "commit_service",
            Service::ConflictsService => "conflicts_service",
            Service::DiffService => "diff_service",
            Service::HealthCheck => "health_check",
            Service::ObjectPoolService => "object_pool_service",
            Service::OperationService => "operation_service",
            Service::RefService => "ref_service",
            Service::RemoteService => "remote_service",
            Service::RepositoryService => "repository_service",
            Service::ServerService => "server_service",
            Service::SmartHttpService => "smart_http_service",
            Service::SshService => "ssh_service",
        }
    }

    /// Fully qualified gRPC service name.
    pub const fn grpc_name(&self) -> &'static str {
        match self {
            Service::BlobService => "gitaly.BlobService",
            Service::CleanupService => "gitaly.CleanupService",
            Service::CommitService => "gitaly.CommitService",
            Service::ConflictsService => "gitaly.ConflictsService",
            Service::DiffService => "gitaly.DiffService",
            Service::HealthCheck => "grpc.health.v1.Health",
            Service::ObjectPoolService => "gitaly.ObjectPoolService",
            Service::OperationService => "gitaly.OperationService",
            Service::RefService => "gitaly.RefService",
            Service::RemoteService => "gitaly.RemoteService",
            Service::RepositoryService => "gitaly.RepositoryService",
            Service::ServerService => "gitaly.ServerService",
            Service::SmartHttpService => "gitaly.SmartHTTPService",
            Service::SshService => "gitaly.SSHService",
        }
    }

    pub fn all() -> &'static [Service] {
        ALL_SERVICES
    }
}

impl FromStr for Service {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_SERVICES
            .iter()
            .find(|service| service.as_str() == s)
            .copied()
            .ok_or_else(|| ConfigError::UnknownService(s.to_string()))
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
