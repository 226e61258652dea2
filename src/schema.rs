//! Schema Configurator
//!
//! For engines with named schemas, makes sure the configured schema exists and
//! resolves before `public` for unqualified names.
//!
//! The database-level `ALTER DATABASE ... SET search_path` is attempted first
//! because it persists for every future session. When it is refused (usually
//! for lack of privilege) the path is applied to the current session only and
//! [`SearchPathScope::Session`] is returned instead of an error.

use crate::connection::ConnectionOptions;
use crate::executor::{LifeError, LifeExecutor};

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Schema every search path ends with
pub const DEFAULT_SCHEMA: &str = "public";

/// Where the search path ended up being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPathScope {
    /// Persisted with `ALTER DATABASE`, visible to every new session
    Database,
    /// Set for the current session only
    Session,
}

/// Outcome of [`SchemaConfigurator::configure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaSetup {
    pub search_path: Vec<String>,
    pub scope: SearchPathScope,
}

/// Search path for `schema`: `["public"]`, or `[schema, "public"]`.
pub fn search_path(schema: &str) -> Vec<String> {
    if is_default_schema(schema) {
        vec![DEFAULT_SCHEMA.to_string()]
    } else {
        vec![schema.to_string(), DEFAULT_SCHEMA.to_string()]
    }
}

fn is_default_schema(schema: &str) -> bool {
    schema.is_empty() || schema == DEFAULT_SCHEMA
}

/// Quotes an identifier for PostgreSQL, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn render_path(path: &[String]) -> String {
    path.iter()
        .map(|schema| quote_ident(schema))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Applies the configured schema to a database.
#[derive(Debug, Clone)]
pub struct SchemaConfigurator {
    schema: String,
    database: String,
}

impl SchemaConfigurator {
    pub fn new(schema: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            database: database.into(),
        }
    }

    pub fn from_options(options: &ConnectionOptions) -> Self {
        Self::new(options.schema.clone(), options.database.clone())
    }

    pub fn search_path(&self) -> Vec<String> {
        search_path(&self.schema)
    }

    /// Creates the schema if needed and applies the search path.
    ///
    /// # Errors
    ///
    /// Returns `LifeError` if the schema cannot be created, or if neither the
    /// `ALTER DATABASE` nor the session-level `SET` succeeds.
    pub fn configure(&self, executor: &dyn LifeExecutor) -> Result<SchemaSetup, LifeError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::schema_span(&self.schema).entered();

        let path = self.search_path();
        let rendered = render_path(&path);

        if !is_default_schema(&self.schema) {
            executor.execute(
                &format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&self.schema)),
                &[],
            )?;
        }

        let alter = format!(
            "ALTER DATABASE {} SET search_path TO {rendered}",
            quote_ident(&self.database)
        );
        let scope = match executor.execute(&alter, &[]) {
            Ok(_) => SearchPathScope::Database,
            Err(e) => {
                log::warn!(
                    "Could not set search_path on database '{}' ({e}), falling back to session-level search_path",
                    self.database
                );
                log::warn!(
                    "search_path is not persisted: sessions opened later by other processes will resolve unqualified names against 'public' only"
                );
                SearchPathScope::Session
            }
        };

        // The open session predates any ALTER DATABASE, so it needs the path too
        if let Err(e) = executor.execute(&format!("SET search_path TO {rendered}"), &[]) {
            if scope == SearchPathScope::Session {
                return Err(e);
            }
            log::warn!(
                "search_path persisted on database '{}' but not applied to the current session ({e}); it takes effect for new sessions",
                self.database
            );
        }

        log::info!(
            "search_path set to [{}] ({})",
            path.join(", "),
            match scope {
                SearchPathScope::Database => "database",
                SearchPathScope::Session => "session only",
            }
        );

        Ok(SchemaSetup {
            search_path: path,
            scope,
        })
    }
}
