//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::info;
use uuid::Uuid;

use crate::error::CoreError;

use super::{
    AllocationSourceRecord, ApplicationRecord, GroupRecord, HistoryRecord, IdentityRecord,
    InstanceRecord, MachineRecord, MachineRequestRecord, NewHistory, NewInstance, NewMachineImage,
    NewSize, NewVolume, PatternMatchRecord, Persistence, ProviderRecord, SizeRecord,
    StatusTransition, UserRecord, VersionRecord, VolumeRecord,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Placeholder name given to sizes that could not be resolved when an
/// instance was first recorded; repaired by the size reconcile pass.
pub const UNKNOWN_SIZE_NAME: &str = "Unknown Size";

/// Sentinel alias for sizes that intentionally have no cloud counterpart.
pub const SIZE_ALIAS_SENTINEL: &str = "N/A";

const MACHINE_SELECT: &str = r#"
    SELECT pm.id, pm.source_id, src.identifier, src.provider_id, src.created_by,
           pm.version_id, av.application_id, src.start_date, src.end_date
      FROM provider_machines pm
      JOIN instance_sources src ON src.id = pm.source_id
      JOIN application_versions av ON av.id = pm.version_id
"#;

const VOLUME_SELECT: &str = r#"
    SELECT v.id, v.source_id, src.identifier, src.provider_id, src.created_by,
           v.name, v.size_gb, src.start_date, src.end_date
      FROM volumes v
      JOIN instance_sources src ON src.id = v.source_id
"#;

const HISTORY_SELECT: &str = r#"
    SELECT h.id, h.uuid, h.instance_id, h.size_id, st.name AS status,
           h.activity, h.start_date, h.end_date, h.extra
      FROM instance_status_history h
      JOIN instance_statuses st ON st.id = h.status_id
"#;

const INSTANCE_COLUMNS: &str = r#"
    i.id, i.provider_alias, i.provider_id, i.created_by, i.created_by_identity,
    i.allocation_source_id, i.start_date, i.end_date
"#;

/// SQLite-backed lifecycle store.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Access the underlying pool, mainly for test seeding.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// This convenience constructor handles all setup:
    /// - Creates parent directories if they don't exist
    /// - Creates the database file if it doesn't exist
    /// - Connects to the database with sensible defaults
    /// - Runs all migrations
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let path_str = path.to_string_lossy();
        let url = format!("sqlite:{}?mode=rwc", path_str);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Create an in-memory store with the schema applied. Used by the test
    /// suites and available for ephemeral local runs.
    pub async fn in_memory() -> Result<Self, CoreError> {
        // A shared in-memory database needs a single connection; separate
        // connections would each see their own empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to open in-memory SQLite: {}", e),
            })?;

        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<(), CoreError> {
        MIGRATOR
            .run(pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })
    }
}

/// Get or create a status row by name, returning its id.
async fn get_or_create_status(
    conn: &mut sqlx::SqliteConnection,
    name: &str,
) -> Result<i64, CoreError> {
    sqlx::query("INSERT OR IGNORE INTO instance_statuses (name) VALUES (?)")
        .bind(name)
        .execute(&mut *conn)
        .await?;
    let (id,): (i64,) = sqlx::query_as("SELECT id FROM instance_statuses WHERE name = ?")
        .bind(name)
        .fetch_one(&mut *conn)
        .await?;
    Ok(id)
}

/// Get or create a user row by username, returning its id.
async fn get_or_create_user(
    conn: &mut sqlx::SqliteConnection,
    username: &str,
) -> Result<i64, CoreError> {
    sqlx::query("INSERT OR IGNORE INTO users (username) VALUES (?)")
        .bind(username)
        .execute(&mut *conn)
        .await?;
    let (id,): (i64,) = sqlx::query_as("SELECT id FROM users WHERE username = ?")
        .bind(username)
        .fetch_one(&mut *conn)
        .await?;
    Ok(id)
}

/// Insert a history row on an open connection, returning its id.
async fn insert_history_row(
    conn: &mut sqlx::SqliteConnection,
    instance_id: i64,
    size_id: i64,
    status_name: &str,
    activity: Option<&str>,
    extra: Option<&serde_json::Value>,
    start_date: DateTime<Utc>,
    end_date: Option<DateTime<Utc>>,
) -> Result<i64, CoreError> {
    let status_id = get_or_create_status(conn, status_name).await?;
    let extra_text = extra.map(|value| value.to_string());
    let result = sqlx::query(
        r#"
        INSERT INTO instance_status_history
            (uuid, instance_id, size_id, status_id, activity, start_date, end_date, extra)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(instance_id)
    .bind(size_id)
    .bind(status_id)
    .bind(activity)
    .bind(start_date)
    .bind(end_date)
    .bind(extra_text)
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Build an `IN (?, ?, ...)` placeholder list of the given arity.
fn placeholders(count: usize) -> String {
    let mut out = String::new();
    for i in 0..count {
        if i > 0 {
            out.push_str(", ");
        }
        out.push('?');
    }
    out
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn list_active_providers(&self) -> Result<Vec<ProviderRecord>, CoreError> {
        let rows = sqlx::query_as::<_, ProviderRecord>(
            r#"
            SELECT id, uuid, name, active, over_allocation_action
            FROM providers
            WHERE active = 1
            ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn get_provider(&self, provider_id: i64) -> Result<Option<ProviderRecord>, CoreError> {
        let row = sqlx::query_as::<_, ProviderRecord>(
            r#"
            SELECT id, uuid, name, active, over_allocation_action
            FROM providers
            WHERE id = ?
            "#,
        )
        .bind(provider_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_current_machines(
        &self,
        provider_id: i64,
    ) -> Result<Vec<MachineRecord>, CoreError> {
        let query = format!(
            "{} WHERE src.provider_id = ? AND src.end_date IS NULL ORDER BY src.identifier",
            MACHINE_SELECT
        );
        let rows = sqlx::query_as::<_, MachineRecord>(&query)
            .bind(provider_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn get_machine_by_identifier(
        &self,
        provider_id: i64,
        identifier: &str,
    ) -> Result<Option<MachineRecord>, CoreError> {
        let query = format!(
            "{} WHERE src.provider_id = ? AND src.identifier = ?",
            MACHINE_SELECT
        );
        let row = sqlx::query_as::<_, MachineRecord>(&query)
            .bind(provider_id)
            .bind(identifier)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn ensure_machine_hierarchy(
        &self,
        provider_id: i64,
        image: &NewMachineImage,
    ) -> Result<(MachineRecord, bool), CoreError> {
        if image.identifier.is_empty() {
            return Err(CoreError::ValidationError {
                field: "identifier".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        if let Some(existing) = self
            .get_machine_by_identifier(provider_id, &image.identifier)
            .await?
        {
            return Ok((existing, false));
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let owner_id = get_or_create_user(&mut *tx, &image.owner_username).await?;

        // Application by name; an end-dated family is never revived, a new
        // image under the same name starts a fresh application.
        let application_id: i64 = match sqlx::query_as::<_, (i64,)>(
            "SELECT id FROM applications WHERE name = ? AND end_date IS NULL",
        )
        .bind(&image.name)
        .fetch_optional(&mut *tx)
        .await?
        {
            Some((id,)) => id,
            None => sqlx::query(
                r#"
                INSERT INTO applications (uuid, name, private, created_by, start_date)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&image.name)
            .bind(image.private)
            .bind(owner_id)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid(),
        };

        let version_id: i64 = match sqlx::query_as::<_, (i64,)>(
            "SELECT id FROM application_versions WHERE application_id = ? AND name = ? AND end_date IS NULL",
        )
        .bind(application_id)
        .bind(&image.version_name)
        .fetch_optional(&mut *tx)
        .await?
        {
            Some((id,)) => id,
            None => sqlx::query(
                "INSERT INTO application_versions (application_id, name, start_date) VALUES (?, ?, ?)",
            )
            .bind(application_id)
            .bind(&image.version_name)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid(),
        };

        // The instance source may already exist (e.g. created by another
        // path); reuse it so the (provider, identifier) pair stays unique.
        let source_id: i64 = match sqlx::query_as::<_, (i64,)>(
            "SELECT id FROM instance_sources WHERE provider_id = ? AND identifier = ?",
        )
        .bind(provider_id)
        .bind(&image.identifier)
        .fetch_optional(&mut *tx)
        .await?
        {
            Some((id,)) => id,
            None => sqlx::query(
                "INSERT INTO instance_sources (identifier, provider_id, created_by, start_date) VALUES (?, ?, ?, ?)",
            )
            .bind(&image.identifier)
            .bind(provider_id)
            .bind(owner_id)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid(),
        };

        sqlx::query("INSERT INTO provider_machines (source_id, version_id) VALUES (?, ?)")
            .bind(source_id)
            .bind(version_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let machine = self
            .get_machine_by_identifier(provider_id, &image.identifier)
            .await?
            .ok_or_else(|| CoreError::DatabaseError {
                operation: "ensure_machine_hierarchy".to_string(),
                details: format!("machine '{}' missing after insert", image.identifier),
            })?;
        Ok((machine, true))
    }

    async fn end_date_machine(
        &self,
        machine_id: i64,
        end_date: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        // end_date, once set, is never cleared or overwritten
        sqlx::query(
            r#"
            UPDATE instance_sources
            SET end_date = ?
            WHERE id = (SELECT source_id FROM provider_machines WHERE id = ?)
              AND end_date IS NULL
            "#,
        )
        .bind(end_date)
        .bind(machine_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_current_machines_in_version(
        &self,
        version_id: i64,
        at: DateTime<Utc>,
    ) -> Result<i64, CoreError> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM provider_machines pm
            JOIN instance_sources src ON src.id = pm.source_id
            WHERE pm.version_id = ?
              AND (src.end_date IS NULL OR src.end_date > ?)
            "#,
        )
        .bind(version_id)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn end_date_version(
        &self,
        version_id: i64,
        end_date: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            "UPDATE application_versions SET end_date = ? WHERE id = ? AND end_date IS NULL",
        )
        .bind(end_date)
        .bind(version_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_current_versions_in_application(
        &self,
        application_id: i64,
        at: DateTime<Utc>,
    ) -> Result<i64, CoreError> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM application_versions
            WHERE application_id = ?
              AND (end_date IS NULL OR end_date > ?)
            "#,
        )
        .bind(application_id)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn end_date_application(
        &self,
        application_id: i64,
        end_date: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        sqlx::query("UPDATE applications SET end_date = ? WHERE id = ? AND end_date IS NULL")
            .bind(end_date)
            .bind(application_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_application(
        &self,
        application_id: i64,
    ) -> Result<Option<ApplicationRecord>, CoreError> {
        let row = sqlx::query_as::<_, ApplicationRecord>(
            r#"
            SELECT id, uuid, name, private, created_by, start_date, end_date
            FROM applications
            WHERE id = ?
            "#,
        )
        .bind(application_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_versions_without_machines(&self) -> Result<Vec<VersionRecord>, CoreError> {
        let rows = sqlx::query_as::<_, VersionRecord>(
            r#"
            SELECT v.id, v.application_id, v.name, v.start_date, v.end_date
            FROM application_versions v
            LEFT JOIN provider_machines pm ON pm.version_id = v.id
            WHERE v.end_date IS NULL AND pm.id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_applications_without_versions(
        &self,
    ) -> Result<Vec<ApplicationRecord>, CoreError> {
        let rows = sqlx::query_as::<_, ApplicationRecord>(
            r#"
            SELECT a.id, a.uuid, a.name, a.private, a.created_by, a.start_date, a.end_date
            FROM applications a
            LEFT JOIN application_versions v ON v.application_id = a.id
            WHERE a.end_date IS NULL AND v.id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_drifted_applications(&self) -> Result<Vec<ApplicationRecord>, CoreError> {
        let rows = sqlx::query_as::<_, ApplicationRecord>(
            r#"
            SELECT a.id, a.uuid, a.name, a.private, a.created_by, a.start_date, a.end_date
            FROM applications a
            WHERE a.end_date IS NULL
              AND EXISTS (
                  SELECT 1 FROM application_versions v WHERE v.application_id = a.id
              )
              AND NOT EXISTS (
                  SELECT 1 FROM application_versions v
                  WHERE v.application_id = a.id AND v.end_date IS NULL
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn add_machine_membership(
        &self,
        machine_id: i64,
        group_id: i64,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO provider_machine_memberships (machine_id, group_id) VALUES (?, ?)",
        )
        .bind(machine_id)
        .bind(group_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn add_version_membership(
        &self,
        version_id: i64,
        group_id: i64,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO application_version_memberships (version_id, group_id) VALUES (?, ?)",
        )
        .bind(version_id)
        .bind(group_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn add_application_membership(
        &self,
        application_id: i64,
        group_id: i64,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO application_memberships (application_id, group_id) VALUES (?, ?)",
        )
        .bind(application_id)
        .bind(group_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_machine_memberships(&self, machine_id: i64) -> Result<i64, CoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM provider_machine_memberships WHERE machine_id = ?")
                .bind(machine_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn count_version_memberships(&self, version_id: i64) -> Result<i64, CoreError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM application_version_memberships WHERE version_id = ?",
        )
        .bind(version_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn count_application_memberships(&self, application_id: i64) -> Result<i64, CoreError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM application_memberships WHERE application_id = ?",
        )
        .bind(application_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn list_machine_membership_groups(
        &self,
        machine_id: i64,
    ) -> Result<Vec<GroupRecord>, CoreError> {
        let rows = sqlx::query_as::<_, GroupRecord>(
            r#"
            SELECT g.id, g.uuid, g.name
            FROM provider_machine_memberships m
            JOIN groups g ON g.id = m.group_id
            WHERE m.machine_id = ?
            ORDER BY g.name
            "#,
        )
        .bind(machine_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn reset_memberships_to(
        &self,
        machine: &MachineRecord,
        keep_group_ids: &[i64],
    ) -> Result<u64, CoreError> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0u64;

        let targets: [(&str, &str, i64); 3] = [
            ("provider_machine_memberships", "machine_id", machine.id),
            (
                "application_version_memberships",
                "version_id",
                machine.version_id,
            ),
            (
                "application_memberships",
                "application_id",
                machine.application_id,
            ),
        ];

        for (table, column, id) in targets {
            let result = if keep_group_ids.is_empty() {
                sqlx::query(&format!("DELETE FROM {} WHERE {} = ?", table, column))
                    .bind(id)
                    .execute(&mut *tx)
                    .await?
            } else {
                let query = format!(
                    "DELETE FROM {} WHERE {} = ? AND group_id NOT IN ({})",
                    table,
                    column,
                    placeholders(keep_group_ids.len())
                );
                let mut q = sqlx::query(&query).bind(id);
                for group_id in keep_group_ids {
                    q = q.bind(group_id);
                }
                q.execute(&mut *tx).await?
            };
            removed += result.rows_affected();
        }

        tx.commit().await?;
        Ok(removed)
    }

    async fn groups_for_project_names(
        &self,
        provider_id: i64,
        project_names: &[String],
    ) -> Result<Vec<GroupRecord>, CoreError> {
        if project_names.is_empty() {
            return Ok(Vec::new());
        }
        let query = format!(
            r#"
            SELECT DISTINCT g.id, g.uuid, g.name
            FROM group_cloud_projects gp
            JOIN groups g ON g.id = gp.group_id
            WHERE gp.provider_id = ? AND gp.project_name IN ({})
            ORDER BY g.name
            "#,
            placeholders(project_names.len())
        );
        let mut q = sqlx::query_as::<_, GroupRecord>(&query).bind(provider_id);
        for name in project_names {
            q = q.bind(name);
        }
        let rows = q.fetch_all(&self.pool).await?;
        Ok(rows)
    }

    async fn project_names_for_group(
        &self,
        provider_id: i64,
        group_id: i64,
    ) -> Result<Vec<String>, CoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT project_name
            FROM group_cloud_projects
            WHERE provider_id = ? AND group_id = ?
            ORDER BY project_name
            "#,
        )
        .bind(provider_id)
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn last_completed_machine_request(
        &self,
        identifier: &str,
    ) -> Result<Option<MachineRequestRecord>, CoreError> {
        let row = sqlx::query_as::<_, MachineRequestRecord>(
            r#"
            SELECT mr.id, mr.new_machine_id, mr.status, mr.access_list, mr.created_at
            FROM machine_requests mr
            JOIN provider_machines pm ON pm.id = mr.new_machine_id
            JOIN instance_sources src ON src.id = pm.source_id
            WHERE src.identifier = ? AND mr.status = 'completed'
            ORDER BY mr.id DESC
            LIMIT 1
            "#,
        )
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_application_pattern_matches(
        &self,
        application_id: i64,
    ) -> Result<Vec<PatternMatchRecord>, CoreError> {
        let rows = sqlx::query_as::<_, PatternMatchRecord>(
            r#"
            SELECT p.id, p.pattern, p.match_type, p.allow_access
            FROM application_pattern_matches ap
            JOIN pattern_matches p ON p.id = ap.pattern_match_id
            WHERE ap.application_id = ?
            "#,
        )
        .bind(application_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_users(&self) -> Result<Vec<UserRecord>, CoreError> {
        let rows =
            sqlx::query_as::<_, UserRecord>("SELECT id, username, email FROM users ORDER BY username")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    async fn get_user_by_username(
        &self,
        username: &str,
    ) -> Result<Option<UserRecord>, CoreError> {
        let row = sqlx::query_as::<_, UserRecord>(
            "SELECT id, username, email FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_current_volumes(
        &self,
        provider_id: i64,
    ) -> Result<Vec<VolumeRecord>, CoreError> {
        let query = format!(
            "{} WHERE src.provider_id = ? AND src.end_date IS NULL ORDER BY src.identifier",
            VOLUME_SELECT
        );
        let rows = sqlx::query_as::<_, VolumeRecord>(&query)
            .bind(provider_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn ensure_volume(
        &self,
        provider_id: i64,
        volume: &NewVolume,
    ) -> Result<(VolumeRecord, bool), CoreError> {
        let lookup = format!(
            "{} WHERE src.provider_id = ? AND src.identifier = ?",
            VOLUME_SELECT
        );
        if let Some(existing) = sqlx::query_as::<_, VolumeRecord>(&lookup)
            .bind(provider_id)
            .bind(&volume.identifier)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok((existing, false));
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let source_id: i64 = match sqlx::query_as::<_, (i64,)>(
            "SELECT id FROM instance_sources WHERE provider_id = ? AND identifier = ?",
        )
        .bind(provider_id)
        .bind(&volume.identifier)
        .fetch_optional(&mut *tx)
        .await?
        {
            Some((id,)) => id,
            None => sqlx::query(
                "INSERT INTO instance_sources (identifier, provider_id, created_by, start_date) VALUES (?, ?, ?, ?)",
            )
            .bind(&volume.identifier)
            .bind(provider_id)
            .bind(volume.created_by)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid(),
        };

        sqlx::query("INSERT INTO volumes (source_id, name, size_gb) VALUES (?, ?, ?)")
            .bind(source_id)
            .bind(&volume.name)
            .bind(volume.size_gb)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let created = sqlx::query_as::<_, VolumeRecord>(&lookup)
            .bind(provider_id)
            .bind(&volume.identifier)
            .fetch_one(&self.pool)
            .await?;
        Ok((created, true))
    }

    async fn end_date_volume(
        &self,
        volume_id: i64,
        end_date: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE instance_sources
            SET end_date = ?
            WHERE id = (SELECT source_id FROM volumes WHERE id = ?)
              AND end_date IS NULL
            "#,
        )
        .bind(end_date)
        .bind(volume_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_identity_by_project_name(
        &self,
        provider_id: i64,
        project_name: &str,
    ) -> Result<Option<IdentityRecord>, CoreError> {
        // More than one identity can share a project; take the oldest.
        let row = sqlx::query_as::<_, IdentityRecord>(
            r#"
            SELECT id, uuid, provider_id, created_by, project_name
            FROM identities
            WHERE provider_id = ? AND project_name = ?
            ORDER BY id
            LIMIT 1
            "#,
        )
        .bind(provider_id)
        .bind(project_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_identities_for_provider(
        &self,
        provider_id: i64,
    ) -> Result<Vec<IdentityRecord>, CoreError> {
        let rows = sqlx::query_as::<_, IdentityRecord>(
            r#"
            SELECT id, uuid, provider_id, created_by, project_name
            FROM identities
            WHERE provider_id = ?
            ORDER BY project_name
            "#,
        )
        .bind(provider_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_identities_for_user(
        &self,
        user_id: i64,
    ) -> Result<Vec<IdentityRecord>, CoreError> {
        let rows = sqlx::query_as::<_, IdentityRecord>(
            r#"
            SELECT id, uuid, provider_id, created_by, project_name
            FROM identities
            WHERE created_by = ?
            ORDER BY id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_current_sizes(&self, provider_id: i64) -> Result<Vec<SizeRecord>, CoreError> {
        let rows = sqlx::query_as::<_, SizeRecord>(
            r#"
            SELECT id, provider_id, alias, name, cpu, mem, disk, start_date, end_date
            FROM sizes
            WHERE provider_id = ? AND end_date IS NULL
            ORDER BY alias
            "#,
        )
        .bind(provider_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn upsert_size(
        &self,
        provider_id: i64,
        size: &NewSize,
    ) -> Result<SizeRecord, CoreError> {
        let existing = sqlx::query_as::<_, SizeRecord>(
            r#"
            SELECT id, provider_id, alias, name, cpu, mem, disk, start_date, end_date
            FROM sizes
            WHERE provider_id = ? AND alias = ? AND end_date IS NULL
            "#,
        )
        .bind(provider_id)
        .bind(&size.alias)
        .fetch_optional(&self.pool)
        .await?;

        let id = match existing {
            Some(current) => {
                sqlx::query("UPDATE sizes SET name = ?, cpu = ?, mem = ?, disk = ? WHERE id = ?")
                    .bind(&size.name)
                    .bind(size.cpu)
                    .bind(size.mem)
                    .bind(size.disk)
                    .bind(current.id)
                    .execute(&self.pool)
                    .await?;
                current.id
            }
            None => sqlx::query(
                r#"
                INSERT INTO sizes (provider_id, alias, name, cpu, mem, disk, start_date)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(provider_id)
            .bind(&size.alias)
            .bind(&size.name)
            .bind(size.cpu)
            .bind(size.mem)
            .bind(size.disk)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?
            .last_insert_rowid(),
        };

        let row = sqlx::query_as::<_, SizeRecord>(
            r#"
            SELECT id, provider_id, alias, name, cpu, mem, disk, start_date, end_date
            FROM sizes
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn end_date_size(
        &self,
        size_id: i64,
        end_date: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        sqlx::query("UPDATE sizes SET end_date = ? WHERE id = ? AND end_date IS NULL")
            .bind(end_date)
            .bind(size_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_unknown_sizes(&self, provider_id: i64) -> Result<Vec<SizeRecord>, CoreError> {
        let rows = sqlx::query_as::<_, SizeRecord>(
            r#"
            SELECT id, provider_id, alias, name, cpu, mem, disk, start_date, end_date
            FROM sizes
            WHERE provider_id = ? AND end_date IS NULL AND name LIKE ?
            ORDER BY alias
            "#,
        )
        .bind(provider_id)
        .bind(format!("%{}%", UNKNOWN_SIZE_NAME))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn get_instance(&self, instance_id: i64) -> Result<Option<InstanceRecord>, CoreError> {
        let query = format!("SELECT {} FROM instances i WHERE i.id = ?", INSTANCE_COLUMNS);
        let row = sqlx::query_as::<_, InstanceRecord>(&query)
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list_active_instances_for_identity(
        &self,
        identity_id: i64,
    ) -> Result<Vec<InstanceRecord>, CoreError> {
        let query = format!(
            r#"
            SELECT DISTINCT {}
            FROM instances i
            LEFT JOIN instance_status_history h
                   ON h.instance_id = i.id AND h.end_date IS NULL
            WHERE i.created_by_identity = ?
              AND (i.end_date IS NULL OR h.id IS NOT NULL)
            ORDER BY i.id
            "#,
            INSTANCE_COLUMNS
        );
        let rows = sqlx::query_as::<_, InstanceRecord>(&query)
            .bind(identity_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn ensure_instance(
        &self,
        provider_id: i64,
        instance: &NewInstance,
    ) -> Result<(InstanceRecord, bool), CoreError> {
        let lookup = format!(
            "SELECT {} FROM instances i WHERE i.provider_id = ? AND i.provider_alias = ?",
            INSTANCE_COLUMNS
        );
        if let Some(existing) = sqlx::query_as::<_, InstanceRecord>(&lookup)
            .bind(provider_id)
            .bind(&instance.provider_alias)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok((existing, false));
        }

        let identity = sqlx::query_as::<_, IdentityRecord>(
            "SELECT id, uuid, provider_id, created_by, project_name FROM identities WHERE id = ?",
        )
        .bind(instance.identity_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(CoreError::IdentityNotFound {
            provider_id,
            project_name: format!("identity:{}", instance.identity_id),
        })?;

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let instance_id = sqlx::query(
            r#"
            INSERT INTO instances
                (provider_alias, provider_id, created_by, created_by_identity, start_date)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&instance.provider_alias)
        .bind(provider_id)
        .bind(identity.created_by)
        .bind(identity.id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        // The first history row opens the chain at the instance's own
        // start date.
        insert_history_row(
            &mut *tx,
            instance_id,
            instance.size_id,
            &instance.status_name,
            instance.activity.as_deref(),
            None,
            now,
            None,
        )
        .await?;

        tx.commit().await?;

        let created = sqlx::query_as::<_, InstanceRecord>(&lookup)
            .bind(provider_id)
            .bind(&instance.provider_alias)
            .fetch_one(&self.pool)
            .await?;
        Ok((created, true))
    }

    async fn end_date_instance_and_history(
        &self,
        instance_id: i64,
        end_date: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE instances SET end_date = ? WHERE id = ? AND end_date IS NULL")
            .bind(end_date)
            .bind(instance_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE instance_status_history SET end_date = ? WHERE instance_id = ? AND end_date IS NULL",
        )
        .bind(end_date)
        .bind(instance_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_last_history(
        &self,
        instance_id: i64,
    ) -> Result<Option<HistoryRecord>, CoreError> {
        let query = format!(
            "{} WHERE h.instance_id = ? ORDER BY h.start_date DESC, h.id DESC LIMIT 1",
            HISTORY_SELECT
        );
        let row = sqlx::query_as::<_, HistoryRecord>(&query)
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list_open_histories(
        &self,
        instance_id: i64,
    ) -> Result<Vec<HistoryRecord>, CoreError> {
        let query = format!(
            "{} WHERE h.instance_id = ? AND h.end_date IS NULL ORDER BY h.start_date",
            HISTORY_SELECT
        );
        let rows = sqlx::query_as::<_, HistoryRecord>(&query)
            .bind(instance_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn find_history_starting_at(
        &self,
        instance_id: i64,
        start_date: DateTime<Utc>,
    ) -> Result<Option<HistoryRecord>, CoreError> {
        let query = format!(
            "{} WHERE h.instance_id = ? AND h.start_date = ? ORDER BY h.id LIMIT 1",
            HISTORY_SELECT
        );
        let row = sqlx::query_as::<_, HistoryRecord>(&query)
            .bind(instance_id)
            .bind(start_date)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn find_history_ending_at(
        &self,
        instance_id: i64,
        end_date: DateTime<Utc>,
    ) -> Result<Option<HistoryRecord>, CoreError> {
        let query = format!(
            "{} WHERE h.instance_id = ? AND h.end_date = ? ORDER BY h.id LIMIT 1",
            HISTORY_SELECT
        );
        let row = sqlx::query_as::<_, HistoryRecord>(&query)
            .bind(instance_id)
            .bind(end_date)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn insert_history(&self, entry: &NewHistory) -> Result<HistoryRecord, CoreError> {
        let mut tx = self.pool.begin().await?;
        let id = insert_history_row(
            &mut *tx,
            entry.instance_id,
            entry.size_id,
            &entry.status_name,
            entry.activity.as_deref(),
            entry.extra.as_ref(),
            entry.start_date,
            entry.end_date,
        )
        .await?;
        tx.commit().await?;

        let query = format!("{} WHERE h.id = ?", HISTORY_SELECT);
        let row = sqlx::query_as::<_, HistoryRecord>(&query)
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    async fn close_open_histories(
        &self,
        instance_id: i64,
        end_date: DateTime<Utc>,
    ) -> Result<u64, CoreError> {
        let result = sqlx::query(
            "UPDATE instance_status_history SET end_date = ? WHERE instance_id = ? AND end_date IS NULL",
        )
        .bind(end_date)
        .bind(instance_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn record_status_transition(
        &self,
        transition: &StatusTransition,
    ) -> Result<HistoryRecord, CoreError> {
        let mut tx = self.pool.begin().await?;

        let last_query = match transition.last_history_id {
            Some(_) => format!("{} WHERE h.id = ? AND h.instance_id = ?", HISTORY_SELECT),
            None => format!(
                "{} WHERE h.instance_id = ? ORDER BY h.start_date DESC, h.id DESC LIMIT 1",
                HISTORY_SELECT
            ),
        };
        let last = match transition.last_history_id {
            Some(id) => {
                sqlx::query_as::<_, HistoryRecord>(&last_query)
                    .bind(id)
                    .bind(transition.instance_id)
                    .fetch_optional(&mut *tx)
                    .await?
            }
            None => {
                sqlx::query_as::<_, HistoryRecord>(&last_query)
                    .bind(transition.instance_id)
                    .fetch_optional(&mut *tx)
                    .await?
            }
        };

        let last = last.ok_or_else(|| CoreError::HistoryContractViolation {
            instance_id: transition.instance_id,
            reason: "a prior history row is required to perform a transition".to_string(),
        })?;
        if last.end_date.is_some() {
            return Err(CoreError::HistoryContractViolation {
                instance_id: transition.instance_id,
                reason: format!("prior history row {} is already closed", last.id),
            });
        }

        sqlx::query("UPDATE instance_status_history SET end_date = ? WHERE id = ?")
            .bind(transition.start_time)
            .bind(last.id)
            .execute(&mut *tx)
            .await?;

        let new_id = insert_history_row(
            &mut *tx,
            transition.instance_id,
            transition.size_id,
            &transition.status_name,
            transition.activity.as_deref(),
            transition.extra.as_ref(),
            transition.start_time,
            None,
        )
        .await?;

        tx.commit().await?;

        info!(
            instance_id = transition.instance_id,
            old_status = %last.status,
            new_status = %transition.status_name,
            at = %transition.start_time,
            "Status transition recorded"
        );

        let query = format!("{} WHERE h.id = ?", HISTORY_SELECT);
        let row = sqlx::query_as::<_, HistoryRecord>(&query)
            .bind(new_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list_allocation_sources(&self) -> Result<Vec<AllocationSourceRecord>, CoreError> {
        let rows = sqlx::query_as::<_, AllocationSourceRecord>(
            r#"
            SELECT id, uuid, name, compute_used, compute_allowed, renewal_strategy
            FROM allocation_sources
            ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_users_for_allocation_source(
        &self,
        source_id: i64,
    ) -> Result<Vec<UserRecord>, CoreError> {
        let rows = sqlx::query_as::<_, UserRecord>(
            r#"
            SELECT u.id, u.username, u.email
            FROM user_allocation_sources uas
            JOIN users u ON u.id = uas.user_id
            WHERE uas.allocation_source_id = ?
            ORDER BY u.username
            "#,
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn count_current_user_allocations(&self, user_id: i64) -> Result<i64, CoreError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM user_allocation_sources WHERE user_id = ? AND end_date IS NULL",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        let (value,): (i64,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(value == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::Persistence;

    #[tokio::test]
    async fn test_from_path_creates_file_and_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.db");

        let store = SqlitePersistence::from_path(&path).await.unwrap();
        assert!(path.exists());
        assert!(store.health_check_db().await.unwrap());

        // Reopening the same file is a no-op migration-wise.
        let reopened = SqlitePersistence::from_path(&path).await.unwrap();
        assert!(reopened.health_check_db().await.unwrap());
    }

    #[tokio::test]
    async fn test_in_memory_store_is_isolated() {
        let first = SqlitePersistence::in_memory().await.unwrap();
        let second = SqlitePersistence::in_memory().await.unwrap();

        sqlx::query("INSERT INTO users (username) VALUES ('alice')")
            .execute(first.pool())
            .await
            .unwrap();

        assert_eq!(first.list_users().await.unwrap().len(), 1);
        assert!(second.list_users().await.unwrap().is_empty());
    }
}
