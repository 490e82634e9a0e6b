mod kine;
mod parser;
mod rewrite;

pub use parser::parse;
pub use rewrite::rewrite;

use rusqlite::types::Value;

/// Command kind of a parsed statement. Transaction keywords are kept
/// apart from data commands so `BEGIN` is never executed as one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Command {
    Select,
    Insert,
    Update,
    Delete,
    Begin,
    Commit,
    Rollback,
    #[default]
    Unknown,
}

impl Command {
    pub fn is_transaction(&self) -> bool {
        matches!(self, Command::Begin | Command::Commit | Command::Rollback)
    }

    /// The word clients see in CommandComplete.
    pub fn tag(&self) -> &'static str {
        match self {
            Command::Select => "SELECT",
            Command::Insert => "INSERT",
            Command::Update => "UPDATE",
            Command::Delete => "DELETE",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Rollback => "ROLLBACK",
            Command::Unknown => "OK",
        }
    }
}

/// One executable statement extracted from a client SQL string.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// Normalized single-statement text.
    pub sql: String,
    pub command: Command,
    /// Referenced tables, first-seen order.
    pub tables: Vec<String>,
    /// One column name per `$n` placeholder, recording the column the
    /// placeholder is compared to or assigned from.
    pub arg_columns: Vec<String>,
    pub returns_rows: bool,
    /// Bound at execution time, one value per placeholder.
    pub parameters: Vec<Value>,
}

impl Statement {
    /// Number of `$n` placeholders the statement expects.
    pub fn num_params(&self) -> usize {
        self.arg_columns.len()
    }

    /// Render the statement for the remote simple-query wire by
    /// substituting every `$n` with its bound argument.
    pub fn sql_for_remote(&self) -> String {
        let mut out = self.sql.clone();
        for (i, value) in self.parameters.iter().enumerate().rev() {
            let marker = format!("${}", i + 1);
            out = out.replace(&marker, &quote_value(value));
        }
        out
    }
}

fn quote_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => f.to_string(),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Blob(b) => {
            let hex: String = b.iter().map(|byte| format!("{byte:02x}")).collect();
            format!("'\\x{hex}'")
        }
    }
}
