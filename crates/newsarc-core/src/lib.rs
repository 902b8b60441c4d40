use sqlx::{SqlitePool, sqlite::SqliteConnectOptions, sqlite::SqlitePoolOptions};
use thiserror::Error;

use newsarc_article::{ParseError, ParsedArticle, parse_article};

/// Storage width limit for message-id values and reference tokens.
pub const MESSAGE_ID_MAX: usize = 255;
pub const SUBJECT_MAX: usize = 1023;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("article identity mismatch: requested {expected}, parsed {found}")]
    IdentityMismatch { expected: String, found: String },
    #[error("value exceeds storage width limit: {value}")]
    ConstraintViolation { value: String },
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// A new mail row was created, plus its membership.
    Stored,
    /// The mail already existed from another list; only a membership was added.
    Linked,
    /// The list already contained this message.
    Skipped,
}

#[derive(Clone)]
pub struct ArchiveStore {
    pool: SqlitePool,
}

impl ArchiveStore {
    pub async fn connect(path: &str) -> Result<Self, StoreError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{}", path)
        };
        let options = SqliteConnectOptions::new()
            .filename(url.trim_start_matches("sqlite:"))
            .create_if_missing(true);
        // One connection for the whole run; the design is single-writer.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn feed_id(&self, name: &str) -> Result<i64, StoreError> {
        let row = sqlx::query_as::<_, (i64,)>("SELECT id FROM list WHERE name = ? LIMIT 1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        if let Some((id,)) = row {
            return Ok(id);
        }
        let result = sqlx::query("INSERT INTO list (name) VALUES (?)")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    /// Returns the mail id if the given list already holds this message.
    pub async fn contains(&self, list_id: i64, message_id: &str) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT m.id FROM mbox b, mail m, list l
             WHERE l.id = ? AND b.list = l.id AND b.mail = m.id AND m.message_id = ?
             LIMIT 1",
        )
        .bind(list_id)
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.0))
    }

    pub async fn mail_id(&self, message_id: &str) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query_as::<_, (i64,)>("SELECT id FROM mail WHERE message_id = ?")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.0))
    }

    async fn person_id(&self, name: &str, address: &str) -> Result<i64, StoreError> {
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT id FROM person WHERE name = ? AND address = ? LIMIT 1",
        )
        .bind(name)
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;
        if let Some((id,)) = row {
            return Ok(id);
        }
        let result = sqlx::query("INSERT INTO person (name, address) VALUES (?, ?)")
            .bind(name)
            .bind(address)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn store_article(
        &self,
        list_id: i64,
        expected_message_id: &str,
        lines: &[Vec<u8>],
    ) -> Result<StoreOutcome, StoreError> {
        let article = parse_article(lines)?;
        if article.message_id != expected_message_id.trim() {
            return Err(StoreError::IdentityMismatch {
                expected: expected_message_id.trim().to_string(),
                found: article.message_id,
            });
        }

        if self.contains(list_id, &article.message_id).await?.is_some() {
            return Ok(StoreOutcome::Skipped);
        }

        let (mail_id, outcome) = match self.mail_id(&article.message_id).await? {
            Some(id) => (id, StoreOutcome::Linked),
            None => (self.insert_mail(&article).await?, StoreOutcome::Stored),
        };

        sqlx::query("INSERT INTO mbox (list, mail) VALUES (?, ?) ON CONFLICT(list, mail) DO NOTHING")
            .bind(list_id)
            .bind(mail_id)
            .execute(&self.pool)
            .await?;

        Ok(outcome)
    }

    async fn insert_mail(&self, article: &ParsedArticle) -> Result<i64, StoreError> {
        check_width(&article.message_id)?;
        let sender = self
            .person_id(&article.sender.name, &article.sender.address)
            .await?;
        let subject: String = article.subject.chars().take(SUBJECT_MAX).collect();

        let result = sqlx::query(
            "INSERT INTO mail (message_id, subject, date, timezone, \"from\", lines, header, content)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&article.message_id)
        .bind(&subject)
        .bind(&article.date_utc)
        .bind(&article.date_offset)
        .bind(sender)
        .bind(article.lines)
        .bind(String::from_utf8_lossy(&article.header).into_owned())
        .bind(String::from_utf8_lossy(&article.body).into_owned())
        .execute(&self.pool)
        .await?;
        let mail_id = result.last_insert_rowid();

        for to in &article.to {
            let person = self.person_id(&to.name, &to.address).await?;
            sqlx::query("INSERT INTO recipient (mail, recipient, \"to\", cc) VALUES (?, ?, 1, 0)")
                .bind(mail_id)
                .bind(person)
                .execute(&self.pool)
                .await?;
        }
        for cc in &article.cc {
            let person = self.person_id(&cc.name, &cc.address).await?;
            sqlx::query("INSERT INTO recipient (mail, recipient, \"to\", cc) VALUES (?, ?, 0, 1)")
                .bind(mail_id)
                .bind(person)
                .execute(&self.pool)
                .await?;
        }

        for token in &article.in_reply_to {
            check_width(token)?;
            sqlx::query("INSERT INTO in_reply_to (mail, replyto_message_id) VALUES (?, ?)")
                .bind(mail_id)
                .bind(token)
                .execute(&self.pool)
                .await?;
        }
        for token in &article.references {
            check_width(token)?;
            sqlx::query("INSERT INTO reference (\"from\", to_message_id) VALUES (?, ?)")
                .bind(mail_id)
                .bind(token)
                .execute(&self.pool)
                .await?;
        }

        Ok(mail_id)
    }

    /// Backfills every unresolved reference whose target message is now known.
    /// Returns the number of rows resolved.
    pub async fn resolve_references(&self) -> Result<u64, StoreError> {
        let pending: Vec<(i64, String)> =
            sqlx::query_as("SELECT id, to_message_id FROM reference WHERE \"to\" IS NULL")
                .fetch_all(&self.pool)
                .await?;
        let mut resolved = 0;
        for (row_id, token) in pending {
            let Some(mail_id) = self.mail_id(&token).await? else {
                continue;
            };
            sqlx::query("UPDATE reference SET \"to\" = ? WHERE id = ?")
                .bind(mail_id)
                .bind(row_id)
                .execute(&self.pool)
                .await?;
            resolved += 1;
        }
        Ok(resolved)
    }

    pub async fn resolve_in_reply_to(&self) -> Result<u64, StoreError> {
        let pending: Vec<(i64, String)> =
            sqlx::query_as("SELECT id, replyto_message_id FROM in_reply_to WHERE replyto IS NULL")
                .fetch_all(&self.pool)
                .await?;
        let mut resolved = 0;
        for (row_id, token) in pending {
            let Some(mail_id) = self.mail_id(&token).await? else {
                continue;
            };
            sqlx::query("UPDATE in_reply_to SET replyto = ? WHERE id = ?")
                .bind(mail_id)
                .bind(row_id)
                .execute(&self.pool)
                .await?;
            resolved += 1;
        }
        Ok(resolved)
    }
}

fn check_width(value: &str) -> Result<(), StoreError> {
    if value.chars().count() > MESSAGE_ID_MAX {
        return Err(StoreError::ConstraintViolation {
            value: value.to_string(),
        });
    }
    Ok(())
}
