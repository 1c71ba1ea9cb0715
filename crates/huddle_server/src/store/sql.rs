#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use huddle_domain::{Group, GroupId, GroupMessage, GroupSummary, PrivateMessage, StoredMessage, User, Username};

use crate::store::{ChatStore, JoinGroupOutcome, StoreError, username_from_row};
use crate::util::time::unix_ms_now;

type PrivateRow = (i64, String, String, String, i64);
type GroupRow = (i64, i64, String, String, i64);
type SummaryRow = (i64, String, String, i64, i64);

/// sqlx-backed store. The backend is chosen by the database URL scheme.
#[derive(Clone)]
pub struct SqlStore {
	backend: Backend,
}

#[derive(Clone)]
enum Backend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
	Mysql(sqlx::MySqlPool),
}

impl SqlStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let backend = if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;
			Backend::Sqlite(pool)
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;
			Backend::Postgres(pool)
		} else if database_url.starts_with("mysql:") || database_url.starts_with("mariadb:") {
			let pool = sqlx::MySqlPool::connect(database_url).await.context("connect mysql")?;
			sqlx::migrate!("migrations/mysql")
				.run(&pool)
				.await
				.context("run mysql migrations")?;
			Backend::Mysql(pool)
		} else {
			return Err(anyhow!("unsupported database_url (use sqlite:, postgres:, mysql:)"));
		};

		Ok(Self { backend })
	}

	pub fn backend_name(&self) -> &'static str {
		match &self.backend {
			Backend::Sqlite(_) => "sqlite",
			Backend::Postgres(_) => "postgres",
			Backend::Mysql(_) => "mysql",
		}
	}

	/// Register a user. Credentials live with whatever issues tokens, so only the name is stored.
	pub async fn add_user(&self, username: &Username) -> Result<(), StoreError> {
		match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query("INSERT OR IGNORE INTO users (username) VALUES (?)")
					.bind(username.as_str())
					.execute(pool)
					.await?;
			}
			Backend::Postgres(pool) => {
				sqlx::query("INSERT INTO users (username) VALUES ($1) ON CONFLICT (username) DO NOTHING")
					.bind(username.as_str())
					.execute(pool)
					.await?;
			}
			Backend::Mysql(pool) => {
				sqlx::query("INSERT IGNORE INTO users (username) VALUES (?)")
					.bind(username.as_str())
					.execute(pool)
					.await?;
			}
		}
		Ok(())
	}
}

fn private_from_row((id, sender, recipient, content, created_at_ms): PrivateRow) -> Result<PrivateMessage, StoreError> {
	Ok(PrivateMessage {
		id,
		sender: username_from_row(sender)?,
		recipient: username_from_row(recipient)?,
		content,
		timestamp_ms: created_at_ms,
	})
}

fn group_from_row((id, group_id, sender, content, created_at_ms): GroupRow) -> Result<GroupMessage, StoreError> {
	Ok(GroupMessage {
		id,
		group_id: GroupId(group_id),
		sender: username_from_row(sender)?,
		content,
		timestamp_ms: created_at_ms,
	})
}

fn summary_from_row((id, name, created_by, member_count, joined): SummaryRow) -> Result<GroupSummary, StoreError> {
	Ok(GroupSummary {
		id: GroupId(id),
		name,
		created_by: username_from_row(created_by)?,
		member_count: member_count.max(0) as u64,
		joined: joined > 0,
	})
}

#[async_trait::async_trait]
impl ChatStore for SqlStore {
	async fn find_user(&self, username: &Username) -> Result<Option<User>, StoreError> {
		let row: Option<(String,)> = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query_as("SELECT username FROM users WHERE username = ?")
					.bind(username.as_str())
					.fetch_optional(pool)
					.await?
			}
			Backend::Postgres(pool) => {
				sqlx::query_as("SELECT username FROM users WHERE username = $1")
					.bind(username.as_str())
					.fetch_optional(pool)
					.await?
			}
			Backend::Mysql(pool) => {
				sqlx::query_as("SELECT username FROM users WHERE username = ?")
					.bind(username.as_str())
					.fetch_optional(pool)
					.await?
			}
		};

		row.map(|(name,)| username_from_row(name).map(|username| User { username }))
			.transpose()
	}

	async fn group_membership(&self, username: &Username, group: GroupId) -> Result<bool, StoreError> {
		let (count,): (i64,) = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query_as("SELECT COUNT(*) FROM group_members WHERE group_id = ? AND username = ?")
					.bind(group.get())
					.bind(username.as_str())
					.fetch_one(pool)
					.await?
			}
			Backend::Postgres(pool) => {
				sqlx::query_as("SELECT COUNT(*) FROM group_members WHERE group_id = $1 AND username = $2")
					.bind(group.get())
					.bind(username.as_str())
					.fetch_one(pool)
					.await?
			}
			Backend::Mysql(pool) => {
				sqlx::query_as("SELECT COUNT(*) FROM group_members WHERE group_id = ? AND username = ?")
					.bind(group.get())
					.bind(username.as_str())
					.fetch_one(pool)
					.await?
			}
		};
		Ok(count > 0)
	}

	async fn group_name(&self, group: GroupId) -> Result<Option<String>, StoreError> {
		let row: Option<(String,)> = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query_as("SELECT name FROM chat_groups WHERE id = ?")
					.bind(group.get())
					.fetch_optional(pool)
					.await?
			}
			Backend::Postgres(pool) => {
				sqlx::query_as("SELECT name FROM chat_groups WHERE id = $1")
					.bind(group.get())
					.fetch_optional(pool)
					.await?
			}
			Backend::Mysql(pool) => {
				sqlx::query_as("SELECT name FROM chat_groups WHERE id = ?")
					.bind(group.get())
					.fetch_optional(pool)
					.await?
			}
		};
		Ok(row.map(|(name,)| name))
	}

	async fn insert_private_message(
		&self,
		sender: &Username,
		recipient: &Username,
		content: &str,
	) -> Result<StoredMessage, StoreError> {
		let timestamp_ms = unix_ms_now();
		let id = match &self.backend {
			Backend::Sqlite(pool) => {
				let mut tx = pool.begin().await?;
				let (id,): (i64,) = sqlx::query_as(
					"INSERT INTO private_messages (sender, recipient, content, created_at_ms) VALUES (?, ?, ?, ?) RETURNING id",
				)
				.bind(sender.as_str())
				.bind(recipient.as_str())
				.bind(content)
				.bind(timestamp_ms)
				.fetch_one(&mut *tx)
				.await?;
				tx.commit().await?;
				id
			}
			Backend::Postgres(pool) => {
				let mut tx = pool.begin().await?;
				let (id,): (i64,) = sqlx::query_as(
					"INSERT INTO private_messages (sender, recipient, content, created_at_ms) VALUES ($1, $2, $3, $4) RETURNING id",
				)
				.bind(sender.as_str())
				.bind(recipient.as_str())
				.bind(content)
				.bind(timestamp_ms)
				.fetch_one(&mut *tx)
				.await?;
				tx.commit().await?;
				id
			}
			Backend::Mysql(pool) => {
				let mut tx = pool.begin().await?;
				let res = sqlx::query(
					"INSERT INTO private_messages (sender, recipient, content, created_at_ms) VALUES (?, ?, ?, ?)",
				)
				.bind(sender.as_str())
				.bind(recipient.as_str())
				.bind(content)
				.bind(timestamp_ms)
				.execute(&mut *tx)
				.await?;
				tx.commit().await?;
				res.last_insert_id() as i64
			}
		};
		Ok(StoredMessage { id, timestamp_ms })
	}

	async fn insert_group_message(
		&self,
		sender: &Username,
		group: GroupId,
		content: &str,
	) -> Result<StoredMessage, StoreError> {
		let timestamp_ms = unix_ms_now();
		let id = match &self.backend {
			Backend::Sqlite(pool) => {
				let mut tx = pool.begin().await?;
				let (id,): (i64,) = sqlx::query_as(
					"INSERT INTO group_messages (group_id, sender, content, created_at_ms) VALUES (?, ?, ?, ?) RETURNING id",
				)
				.bind(group.get())
				.bind(sender.as_str())
				.bind(content)
				.bind(timestamp_ms)
				.fetch_one(&mut *tx)
				.await?;
				tx.commit().await?;
				id
			}
			Backend::Postgres(pool) => {
				let mut tx = pool.begin().await?;
				let (id,): (i64,) = sqlx::query_as(
					"INSERT INTO group_messages (group_id, sender, content, created_at_ms) VALUES ($1, $2, $3, $4) RETURNING id",
				)
				.bind(group.get())
				.bind(sender.as_str())
				.bind(content)
				.bind(timestamp_ms)
				.fetch_one(&mut *tx)
				.await?;
				tx.commit().await?;
				id
			}
			Backend::Mysql(pool) => {
				let mut tx = pool.begin().await?;
				let res =
					sqlx::query("INSERT INTO group_messages (group_id, sender, content, created_at_ms) VALUES (?, ?, ?, ?)")
						.bind(group.get())
						.bind(sender.as_str())
						.bind(content)
						.bind(timestamp_ms)
						.execute(&mut *tx)
						.await?;
				tx.commit().await?;
				res.last_insert_id() as i64
			}
		};
		Ok(StoredMessage { id, timestamp_ms })
	}

	async fn list_private_messages(&self, a: &Username, b: &Username) -> Result<Vec<PrivateMessage>, StoreError> {
		let rows: Vec<PrivateRow> = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query_as(
					"SELECT id, sender, recipient, content, created_at_ms FROM private_messages \
					WHERE (sender = ? AND recipient = ?) OR (sender = ? AND recipient = ?) \
					ORDER BY id",
				)
				.bind(a.as_str())
				.bind(b.as_str())
				.bind(b.as_str())
				.bind(a.as_str())
				.fetch_all(pool)
				.await?
			}
			Backend::Postgres(pool) => {
				sqlx::query_as(
					"SELECT id, sender, recipient, content, created_at_ms FROM private_messages \
					WHERE (sender = $1 AND recipient = $2) OR (sender = $2 AND recipient = $1) \
					ORDER BY id",
				)
				.bind(a.as_str())
				.bind(b.as_str())
				.fetch_all(pool)
				.await?
			}
			Backend::Mysql(pool) => {
				sqlx::query_as(
					"SELECT id, sender, recipient, content, created_at_ms FROM private_messages \
					WHERE (sender = ? AND recipient = ?) OR (sender = ? AND recipient = ?) \
					ORDER BY id",
				)
				.bind(a.as_str())
				.bind(b.as_str())
				.bind(b.as_str())
				.bind(a.as_str())
				.fetch_all(pool)
				.await?
			}
		};
		rows.into_iter().map(private_from_row).collect()
	}

	async fn list_group_messages(&self, group: GroupId) -> Result<Vec<GroupMessage>, StoreError> {
		let rows: Vec<GroupRow> = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query_as(
					"SELECT id, group_id, sender, content, created_at_ms FROM group_messages \
					WHERE group_id = ? ORDER BY id",
				)
				.bind(group.get())
				.fetch_all(pool)
				.await?
			}
			Backend::Postgres(pool) => {
				sqlx::query_as(
					"SELECT id, group_id, sender, content, created_at_ms FROM group_messages \
					WHERE group_id = $1 ORDER BY id",
				)
				.bind(group.get())
				.fetch_all(pool)
				.await?
			}
			Backend::Mysql(pool) => {
				sqlx::query_as(
					"SELECT id, group_id, sender, content, created_at_ms FROM group_messages \
					WHERE group_id = ? ORDER BY id",
				)
				.bind(group.get())
				.fetch_all(pool)
				.await?
			}
		};
		rows.into_iter().map(group_from_row).collect()
	}

	async fn list_contacts(&self, username: &Username) -> Result<Vec<Username>, StoreError> {
		let rows: Vec<(String,)> = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query_as("SELECT username FROM users WHERE username <> ? ORDER BY username")
					.bind(username.as_str())
					.fetch_all(pool)
					.await?
			}
			Backend::Postgres(pool) => {
				sqlx::query_as("SELECT username FROM users WHERE username <> $1 ORDER BY username")
					.bind(username.as_str())
					.fetch_all(pool)
					.await?
			}
			Backend::Mysql(pool) => {
				sqlx::query_as("SELECT username FROM users WHERE username <> ? ORDER BY username")
					.bind(username.as_str())
					.fetch_all(pool)
					.await?
			}
		};
		rows.into_iter().map(|(name,)| username_from_row(name)).collect()
	}

	async fn list_groups(&self, viewer: &Username) -> Result<Vec<GroupSummary>, StoreError> {
		let rows: Vec<SummaryRow> = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query_as(
					"SELECT g.id, g.name, g.created_by, \
					(SELECT COUNT(*) FROM group_members m WHERE m.group_id = g.id), \
					(SELECT COUNT(*) FROM group_members m WHERE m.group_id = g.id AND m.username = ?) \
					FROM chat_groups g ORDER BY g.id",
				)
				.bind(viewer.as_str())
				.fetch_all(pool)
				.await?
			}
			Backend::Postgres(pool) => {
				sqlx::query_as(
					"SELECT g.id, g.name, g.created_by, \
					(SELECT COUNT(*) FROM group_members m WHERE m.group_id = g.id), \
					(SELECT COUNT(*) FROM group_members m WHERE m.group_id = g.id AND m.username = $1) \
					FROM chat_groups g ORDER BY g.id",
				)
				.bind(viewer.as_str())
				.fetch_all(pool)
				.await?
			}
			Backend::Mysql(pool) => {
				sqlx::query_as(
					"SELECT g.id, g.name, g.created_by, \
					(SELECT COUNT(*) FROM group_members m WHERE m.group_id = g.id), \
					(SELECT COUNT(*) FROM group_members m WHERE m.group_id = g.id AND m.username = ?) \
					FROM chat_groups g ORDER BY g.id",
				)
				.bind(viewer.as_str())
				.fetch_all(pool)
				.await?
			}
		};
		rows.into_iter().map(summary_from_row).collect()
	}

	async fn create_group(&self, name: &str, creator: &Username) -> Result<Group, StoreError> {
		let id = match &self.backend {
			Backend::Sqlite(pool) => {
				let mut tx = pool.begin().await?;
				let (id,): (i64,) = sqlx::query_as("INSERT INTO chat_groups (name, created_by) VALUES (?, ?) RETURNING id")
					.bind(name)
					.bind(creator.as_str())
					.fetch_one(&mut *tx)
					.await?;
				sqlx::query("INSERT INTO group_members (group_id, username) VALUES (?, ?)")
					.bind(id)
					.bind(creator.as_str())
					.execute(&mut *tx)
					.await?;
				tx.commit().await?;
				id
			}
			Backend::Postgres(pool) => {
				let mut tx = pool.begin().await?;
				let (id,): (i64,) =
					sqlx::query_as("INSERT INTO chat_groups (name, created_by) VALUES ($1, $2) RETURNING id")
						.bind(name)
						.bind(creator.as_str())
						.fetch_one(&mut *tx)
						.await?;
				sqlx::query("INSERT INTO group_members (group_id, username) VALUES ($1, $2)")
					.bind(id)
					.bind(creator.as_str())
					.execute(&mut *tx)
					.await?;
				tx.commit().await?;
				id
			}
			Backend::Mysql(pool) => {
				let mut tx = pool.begin().await?;
				let res = sqlx::query("INSERT INTO chat_groups (name, created_by) VALUES (?, ?)")
					.bind(name)
					.bind(creator.as_str())
					.execute(&mut *tx)
					.await?;
				let id = res.last_insert_id() as i64;
				sqlx::query("INSERT INTO group_members (group_id, username) VALUES (?, ?)")
					.bind(id)
					.bind(creator.as_str())
					.execute(&mut *tx)
					.await?;
				tx.commit().await?;
				id
			}
		};

		Ok(Group {
			id: GroupId(id),
			name: name.to_string(),
			created_by: creator.clone(),
		})
	}

	async fn join_group(&self, username: &Username, group: GroupId) -> Result<JoinGroupOutcome, StoreError> {
		if self.group_name(group).await?.is_none() {
			return Ok(JoinGroupOutcome::NoSuchGroup);
		}

		let inserted = match &self.backend {
			Backend::Sqlite(pool) => sqlx::query("INSERT OR IGNORE INTO group_members (group_id, username) VALUES (?, ?)")
				.bind(group.get())
				.bind(username.as_str())
				.execute(pool)
				.await?
				.rows_affected(),
			Backend::Postgres(pool) => sqlx::query(
				"INSERT INTO group_members (group_id, username) VALUES ($1, $2) ON CONFLICT (group_id, username) DO NOTHING",
			)
			.bind(group.get())
			.bind(username.as_str())
			.execute(pool)
			.await?
			.rows_affected(),
			Backend::Mysql(pool) => sqlx::query("INSERT IGNORE INTO group_members (group_id, username) VALUES (?, ?)")
				.bind(group.get())
				.bind(username.as_str())
				.execute(pool)
				.await?
				.rows_affected(),
		};

		Ok(if inserted > 0 {
			JoinGroupOutcome::Joined
		} else {
			JoinGroupOutcome::AlreadyMember
		})
	}
}
