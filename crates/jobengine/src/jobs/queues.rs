//! Shared vocabulary between enqueuers and handler owners. The engine itself
//! treats every name here as an opaque string.

pub const DEFAULT: &str = "default";
pub const CLOUDPODS: &str = "cloudpods";
pub const BACKUPS: &str = "backups";
pub const WEBHOOKS: &str = "webhooks";
pub const DNS: &str = "dns";
pub const MAINTENANCE: &str = "maintenance";

pub mod job_types {
    pub const POD_PROVISION: &str = "pod.provision";
    pub const POD_DEPROVISION: &str = "pod.deprovision";
    pub const DNS_RECORD_SYNC: &str = "dns.record_sync";
    pub const WEBHOOK_DELIVER: &str = "webhook.deliver";
    pub const BACKUP_RETENTION: &str = "backup.retention";
    pub const HEALTH_CHECK: &str = "health.check";
}
