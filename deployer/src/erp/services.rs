//! Scripts run on cluster instances and inside one-shot containers

use erp_template::intrinsic;
use serde_json::{json, Value};

/// Shared configuration file every ERP role reads (relative to the bench directory)
pub const SITE_CONFIG_FILE: &str = "sites/common_site_config.json";

/// Keys the site creator waits for in [SITE_CONFIG_FILE]
pub const REQUIRED_SITE_KEYS: [&str; 3] = ["db_host", "redis_cache", "redis_queue"];

/// Health check of roles running the ERP application
pub const BACKEND_HEALTH_CMD: &str = "healthcheck.sh";

/// Health check of the frontend
pub const FRONTEND_HEALTH_CMD: &str = "curl -fsS localhost:8080";

/// Health check of the database
pub const DATABASE_HEALTH_CMD: &str = "mysqladmin ping -h localhost --silent";

/// Entrypoint of the frontend
pub const FRONTEND_ENTRYPOINT: &str = "nginx-entrypoint.sh";

/// Command to format (once) and mount the data volume on a cluster instance
pub fn mount_data_volume_cmd(device: &str, mount_path: &str) -> String {
    format!(
        r#"
# Format the data volume only if it carries no filesystem yet
if ! blkid {device} >/dev/null 2>&1; then
  mkfs -t xfs {device}
fi
mkdir -p {mount_path}
echo "{device} {mount_path} xfs defaults,nofail 0 2" >> /etc/fstab
mount -a

# ERP containers run as uid 1000 (frappe)
chown 1000:1000 {mount_path}
"#
    )
}

/// Instance user data: mount the data volume, then join `cluster`.
///
/// `cluster` is the name of the cluster (usually a `Ref`), so the script is rendered with
/// `Fn::Join` and base64-encoded by the provisioning engine.
pub fn user_data(cluster: Value, device: &str, mount_path: &str) -> Value {
    let mut script = String::from("#!/bin/bash\nset -euo pipefail\n");
    script.push_str(&mount_data_volume_cmd(device, mount_path));
    script.push_str("\necho ECS_CLUSTER=");
    intrinsic::base64(intrinsic::join(
        "",
        [
            json!(script),
            cluster,
            json!(" >> /etc/ecs/ecs.config\n"),
        ],
    ))
}

/// Command of the configuration job.
///
/// Reads the connection details from its environment (`DB_HOST`, `DB_PORT`, `REDIS_URL`,
/// `SOCKETIO_PORT`) and writes them to [SITE_CONFIG_FILE].
pub const CONFIGURE_SITE_CMD: &str = r#"
set -e
ls -1 apps > sites/apps.txt
bench set-config -g db_host "$DB_HOST"
bench set-config -gp db_port "$DB_PORT"
bench set-config -g redis_cache "$REDIS_URL"
bench set-config -g redis_queue "$REDIS_URL"
bench set-config -g redis_socketio "$REDIS_URL"
bench set-config -gp socketio_port "$SOCKETIO_PORT"
"#;

/// Command of the site-creation job.
///
/// Polls [SITE_CONFIG_FILE] every `interval` seconds until all [REQUIRED_SITE_KEYS] are set and
/// exits with status 1 once `timeout` seconds of wall-clock time have passed without them. Then
/// creates `$SITE_NAME`, installs the ERP app, and makes it the default site.
pub fn create_site_cmd(interval: u64, timeout: u64) -> String {
    let checks = REQUIRED_SITE_KEYS
        .iter()
        .map(|key| format!(r#"[ -n "$(jq -r '.{key} // empty' {SITE_CONFIG_FILE} 2>/dev/null)" ]"#))
        .collect::<Vec<_>>()
        .join(" && ");
    format!(
        r#"
start=$(date +%s)
until [ -f {SITE_CONFIG_FILE} ] && {checks}; do
  if [ "$(( $(date +%s) - start ))" -ge {timeout} ]; then
    echo "{SITE_CONFIG_FILE} not configured after {timeout}s" >&2
    exit 1
  fi
  sleep {interval}
done
echo "{SITE_CONFIG_FILE} configured after $(( $(date +%s) - start ))s"
bench new-site --mariadb-user-host-login-scope='%' --admin-password="$ADMIN_PASSWORD" --db-root-username=root --db-root-password="$DB_ROOT_PASSWORD" --install-app erpnext --set-default "$SITE_NAME"
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_site_cmd_waits_for_every_key() {
        let cmd = create_site_cmd(5, 120);
        for key in REQUIRED_SITE_KEYS {
            assert!(cmd.contains(&format!(".{key} // empty")), "{key}");
        }
        assert!(cmd.contains("sleep 5"));
        assert!(cmd.contains(r#"-ge 120"#));
        // Elapsed time is measured by the clock, not by summing sleeps
        assert!(cmd.contains("start=$(date +%s)"));
        assert!(cmd.contains(r#"[ "$(( $(date +%s) - start ))" -ge 120 ]"#));
        assert!(cmd.contains("exit 1"));
        assert!(cmd.contains("--install-app erpnext --set-default \"$SITE_NAME\""));
        // The exit path comes before site creation
        assert!(cmd.find("exit 1").unwrap() < cmd.find("bench new-site").unwrap());
    }

    #[test]
    fn test_configure_site_cmd_sets_required_keys() {
        for key in REQUIRED_SITE_KEYS {
            assert!(CONFIGURE_SITE_CMD.contains(&format!("set-config -g {key} ")), "{key}");
        }
    }

    #[test]
    fn test_user_data_joins_cluster() {
        let cluster = json!({"Ref": "Cluster"});
        let data = user_data(cluster.clone(), "/dev/xvdb", "/mnt/erp");
        let parts = data["Fn::Base64"]["Fn::Join"][1].as_array().unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1], cluster);
        let script = parts[0].as_str().unwrap();
        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains("mkfs -t xfs /dev/xvdb"));
        assert!(script.contains("chown 1000:1000 /mnt/erp"));
        assert!(script.ends_with("echo ECS_CLUSTER="));
    }

    #[cfg(unix)]
    #[test]
    fn test_create_site_cmd_times_out() {
        // Run in an empty directory so the configuration file never appears
        let dir = std::env::temp_dir().join(format!("erp_deployer_site_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let status = std::process::Command::new("sh")
            .arg("-c")
            .arg(create_site_cmd(1, 1))
            .current_dir(&dir)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .unwrap();
        std::fs::remove_dir_all(&dir).ok();
        assert_eq!(status.code(), Some(1));
    }

    #[cfg(unix)]
    #[test]
    fn test_create_site_cmd_timeout_counts_slow_checks() {
        use std::os::unix::fs::PermissionsExt;

        // A present but empty configuration file and a `jq` that takes 2s to find nothing
        let dir = std::env::temp_dir().join(format!("erp_deployer_slow_{}", std::process::id()));
        let bin = dir.join("bin");
        std::fs::create_dir_all(dir.join("sites")).unwrap();
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(dir.join(SITE_CONFIG_FILE), "{}").unwrap();
        let jq = bin.join("jq");
        std::fs::write(&jq, "#!/bin/sh\nsleep 2\n").unwrap();
        std::fs::set_permissions(&jq, std::fs::Permissions::from_mode(0o755)).unwrap();
        let path = format!("{}:{}", bin.display(), std::env::var("PATH").unwrap_or_default());

        let started = std::time::Instant::now();
        let status = std::process::Command::new("sh")
            .arg("-c")
            .arg(create_site_cmd(1, 3))
            .current_dir(&dir)
            .env("PATH", path)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .unwrap();
        let elapsed = started.elapsed();
        std::fs::remove_dir_all(&dir).ok();

        assert_eq!(status.code(), Some(1));
        // Summing sleeps alone would take three slow rounds (about 9s)
        assert!(elapsed < std::time::Duration::from_secs(8), "{elapsed:?}");
    }
}
