//! Database detection and hot dumps.
//!
//! Containers are classified into a database family by substring match on
//! their image name, then dumped with the family's native logical export via
//! exec. Detection by image name is best-effort; retagged images can defeat
//! it.

use crate::error::{Result, SnapError};
use crate::runtime::ContainerRuntime;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbFamily {
    Postgres,
    MySql,
    Mongo,
    Unknown,
}

impl fmt::Display for DbFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DbFamily::Postgres => "postgres",
            DbFamily::MySql => "mysql",
            DbFamily::Mongo => "mongodb",
            DbFamily::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Classify a container by its image name.
pub fn detect_family(image: &str) -> DbFamily {
    let image = image.to_lowercase();
    if image.contains("postgres") {
        DbFamily::Postgres
    } else if image.contains("mysql") || image.contains("mariadb") {
        DbFamily::MySql
    } else if image.contains("mongo") {
        DbFamily::Mongo
    } else {
        DbFamily::Unknown
    }
}

/// Take a logical dump from a database container, returning captured stdout.
///
/// Each family tries a ladder of commands; the next command is only
/// attempted after a nonzero exit. Empty output with a clean exit means the
/// database holds no data and is not an error.
pub async fn dump(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    family: DbFamily,
) -> Result<Vec<u8>> {
    match family {
        DbFamily::Postgres => dump_postgres(runtime, container_id).await,
        DbFamily::MySql => dump_mysql(runtime, container_id).await,
        DbFamily::Mongo => dump_mongo(runtime, container_id).await,
        DbFamily::Unknown => Err(SnapError::Runtime(format!(
            "unsupported database family for container {container_id}"
        ))),
    }
}

async fn dump_postgres(runtime: &dyn ContainerRuntime, id: &str) -> Result<Vec<u8>> {
    // Prefer a serializable-deferrable snapshot; older servers and limited
    // roles reject it, so fall back step by step.
    match runtime
        .exec(id, &["pg_dumpall", "-U", "postgres", "--serializable-deferrable"])
        .await
    {
        Ok(out) => Ok(out),
        Err(_) => match runtime.exec(id, &["pg_dumpall", "-U", "postgres"]).await {
            Ok(out) => Ok(out),
            Err(_) => runtime
                .exec(id, &["pg_dumpall"])
                .await
                .map_err(|e| SnapError::Runtime(format!("failed to dump postgres: {e}"))),
        },
    }
}

async fn dump_mysql(runtime: &dyn ContainerRuntime, id: &str) -> Result<Vec<u8>> {
    // The root password comes from the container's own environment; going
    // through a shell lets the ${...:-...} expansion pick whichever is set.
    let shell_cmd = concat!(
        "mysqldump --all-databases ",
        "--single-transaction --quick --routines --triggers --events ",
        "-u root -p\"${MYSQL_ROOT_PASSWORD:-${MYSQL_PWD}}\"",
    );

    match runtime.exec(id, &["sh", "-c", shell_cmd]).await {
        Ok(out) => Ok(out),
        Err(_) => runtime
            .exec(
                id,
                &[
                    "mysqldump",
                    "--all-databases",
                    "--single-transaction",
                    "--quick",
                    "--routines",
                    "--triggers",
                    "--events",
                    "-u",
                    "root",
                ],
            )
            .await
            .map_err(|e| SnapError::Runtime(format!("failed to dump mysql: {e}"))),
    }
}

async fn dump_mongo(runtime: &dyn ContainerRuntime, id: &str) -> Result<Vec<u8>> {
    runtime
        .exec(id, &["mongodump", "--archive"])
        .await
        .map_err(|e| SnapError::Runtime(format!("failed to dump mongodb: {e}")))
}
