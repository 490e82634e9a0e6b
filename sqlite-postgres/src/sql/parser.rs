//! Extraction of [`Statement`] records from postgres-dialect SQL.
//!
//! The walker visits the sqlparser AST once per statement. Binary
//! expressions open a column scope: column references seen inside the
//! scope accumulate, and a placeholder binds to the most recent one,
//! which is the column on the other side of the comparison. Placeholders
//! in INSERT value lists and UPDATE assignments bind positionally to the
//! statement's target column list instead.

use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, FunctionArg, FunctionArgExpr, FunctionArguments,
    Insert, Join, JoinConstraint, JoinOperator, ObjectName, Query, Select, SelectItem, SetExpr,
    TableFactor, TableObject, TableWithJoins,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::{Parser, ParserError};

use super::{Command, Statement};

/// Parse a (possibly multi-statement) SQL string into statement records.
///
/// Empty input yields an empty list; parse errors are surfaced verbatim.
pub fn parse(sql: &str) -> Result<Vec<Statement>, ParserError> {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    // PRAGMA is engine-side vocabulary the postgres grammar does not
    // know; it only ever arrives from the rewriter and runs verbatim.
    if trimmed.to_ascii_uppercase().starts_with("PRAGMA") {
        return Ok(vec![Statement {
            sql: trimmed.trim_end_matches(';').to_string(),
            command: Command::Unknown,
            tables: Vec::new(),
            arg_columns: Vec::new(),
            returns_rows: false,
            parameters: Vec::new(),
        }]);
    }

    let statements = Parser::parse_sql(&PostgreSqlDialect {}, sql)?;
    Ok(statements.iter().map(extract).collect())
}

fn extract(stmt: &ast::Statement) -> Statement {
    let mut walker = Walker::default();
    walker.walk_statement(stmt);

    // Every placeholder gets an argument column; the ones the walk could
    // not attribute stay anonymous and default to text downstream.
    while walker.arg_columns.len() < walker.max_param {
        walker.arg_columns.push(String::new());
    }

    Statement {
        sql: stmt.to_string(),
        command: walker.command,
        tables: walker.tables,
        arg_columns: walker.arg_columns,
        returns_rows: walker.command == Command::Select,
        parameters: Vec::new(),
    }
}

#[derive(Default)]
struct Walker {
    command: Command,
    tables: Vec<String>,
    arg_columns: Vec<String>,
    /// INSERT/UPDATE target columns, for positional placeholder binding.
    target_columns: Vec<String>,
    /// Columns referenced inside the currently open expression scope.
    expr_columns: Vec<String>,
    scope_open: bool,
    /// Ordinal of the next unnumbered placeholder.
    next_ordinal: usize,
    /// Highest placeholder index seen.
    max_param: usize,
}

impl Walker {
    fn walk_statement(&mut self, stmt: &ast::Statement) {
        match stmt {
            ast::Statement::Query(query) => {
                self.set_command(Command::Select);
                self.walk_query(query);
            }
            ast::Statement::Insert(insert) => {
                self.set_command(Command::Insert);
                self.walk_insert(insert);
            }
            ast::Statement::Update {
                table,
                assignments,
                from,
                selection,
                ..
            } => {
                self.set_command(Command::Update);
                self.walk_table_with_joins(table);
                for assignment in assignments {
                    if let AssignmentTarget::ColumnName(name) = &assignment.target {
                        self.target_columns.push(last_ident(name));
                    }
                }
                for assignment in assignments {
                    self.walk_expr(&assignment.value);
                }
                if let Some(from) = from {
                    match from {
                        ast::UpdateTableFromKind::BeforeSet(tables)
                        | ast::UpdateTableFromKind::AfterSet(tables) => {
                            for table in tables {
                                self.walk_table_with_joins(table);
                            }
                        }
                    }
                }
                if let Some(selection) = selection {
                    self.walk_expr(selection);
                }
            }
            ast::Statement::Delete(delete) => {
                self.set_command(Command::Delete);
                let from = match &delete.from {
                    FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables) => {
                        tables
                    }
                };
                for table in from {
                    self.walk_table_with_joins(table);
                }
                if let Some(using) = &delete.using {
                    for table in using {
                        self.walk_table_with_joins(table);
                    }
                }
                if let Some(selection) = &delete.selection {
                    self.walk_expr(selection);
                }
            }
            ast::Statement::StartTransaction { .. } => self.set_command(Command::Begin),
            ast::Statement::Commit { .. } => self.set_command(Command::Commit),
            ast::Statement::Rollback { .. } => self.set_command(Command::Rollback),
            ast::Statement::CreateTable(create) => {
                self.record_table(&create.name);
            }
            ast::Statement::CreateIndex(create) => {
                self.record_table(&create.table_name);
            }
            ast::Statement::Drop { names, .. } => {
                for name in names {
                    self.record_table(name);
                }
            }
            _ => {}
        }
    }

    fn walk_insert(&mut self, insert: &Insert) {
        if let TableObject::TableName(name) = &insert.table {
            self.record_table(name);
        }
        for column in &insert.columns {
            self.target_columns.push(column.value.clone());
        }
        if let Some(source) = &insert.source {
            self.walk_query(source);
        }
    }

    fn walk_query(&mut self, query: &Query) {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.walk_query(&cte.query);
            }
        }
        self.walk_set_expr(&query.body);
    }

    fn walk_set_expr(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => self.walk_select(select),
            SetExpr::Query(query) => self.walk_query(query),
            SetExpr::SetOperation { left, right, .. } => {
                self.walk_set_expr(left);
                self.walk_set_expr(right);
            }
            SetExpr::Values(values) => {
                for row in &values.rows {
                    for expr in row {
                        self.walk_expr(expr);
                    }
                }
            }
            _ => {}
        }
    }

    fn walk_select(&mut self, select: &Select) {
        for table in &select.from {
            self.walk_table_with_joins(table);
        }
        for item in &select.projection {
            match item {
                SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                    self.walk_expr(expr)
                }
                _ => {}
            }
        }
        if let Some(selection) = &select.selection {
            self.walk_expr(selection);
        }
        if let Some(having) = &select.having {
            self.walk_expr(having);
        }
    }

    fn walk_table_with_joins(&mut self, table: &TableWithJoins) {
        self.walk_table_factor(&table.relation);
        for join in &table.joins {
            self.walk_join(join);
        }
    }

    fn walk_join(&mut self, join: &Join) {
        self.walk_table_factor(&join.relation);
        let constraint = match &join.join_operator {
            JoinOperator::Join(c)
            | JoinOperator::Inner(c)
            | JoinOperator::Left(c)
            | JoinOperator::LeftOuter(c)
            | JoinOperator::Right(c)
            | JoinOperator::RightOuter(c)
            | JoinOperator::FullOuter(c) => Some(c),
            _ => None,
        };
        if let Some(JoinConstraint::On(expr)) = constraint {
            self.walk_expr(expr);
        }
    }

    fn walk_table_factor(&mut self, factor: &TableFactor) {
        match factor {
            TableFactor::Table { name, .. } => self.record_table(name),
            TableFactor::Derived { subquery, .. } => self.walk_query(subquery),
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => self.walk_table_with_joins(table_with_joins),
            _ => {}
        }
    }

    fn walk_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::BinaryOp { left, right, .. } => {
                let opened = self.open_scope();
                self.walk_expr(left);
                self.walk_expr(right);
                if opened {
                    self.close_scope();
                }
            }
            Expr::InList { expr, list, .. } => {
                let opened = self.open_scope();
                self.walk_expr(expr);
                for item in list {
                    self.walk_expr(item);
                }
                if opened {
                    self.close_scope();
                }
            }
            Expr::InSubquery { expr, subquery, .. } => {
                let opened = self.open_scope();
                self.walk_expr(expr);
                self.walk_query(subquery);
                if opened {
                    self.close_scope();
                }
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                let opened = self.open_scope();
                self.walk_expr(expr);
                self.walk_expr(low);
                self.walk_expr(high);
                if opened {
                    self.close_scope();
                }
            }
            Expr::Like { expr, pattern, .. } | Expr::ILike { expr, pattern, .. } => {
                let opened = self.open_scope();
                self.walk_expr(expr);
                self.walk_expr(pattern);
                if opened {
                    self.close_scope();
                }
            }
            Expr::Identifier(ident) => self.on_column(&ident.value),
            Expr::CompoundIdentifier(parts) => {
                for part in parts {
                    self.on_column(&part.value);
                }
            }
            Expr::Value(value) => {
                if let ast::Value::Placeholder(marker) = &value.value {
                    self.on_placeholder(marker);
                }
            }
            Expr::Cast {
                expr, data_type, ..
            } => self.walk_cast(expr, data_type),
            Expr::Nested(inner)
            | Expr::UnaryOp { expr: inner, .. }
            | Expr::IsNull(inner)
            | Expr::IsNotNull(inner)
            | Expr::IsTrue(inner)
            | Expr::IsFalse(inner) => self.walk_expr(inner),
            Expr::Function(func) => self.walk_function(func),
            Expr::Tuple(items) => {
                for item in items {
                    self.walk_expr(item);
                }
            }
            Expr::Subquery(query) => self.walk_query(query),
            Expr::Exists { subquery, .. } => self.walk_query(subquery),
            Expr::Case {
                operand,
                conditions,
                else_result,
                ..
            } => {
                if let Some(operand) = operand {
                    self.walk_expr(operand);
                }
                for when in conditions {
                    self.walk_expr(&when.condition);
                    self.walk_expr(&when.result);
                }
                if let Some(else_result) = else_result {
                    self.walk_expr(else_result);
                }
            }
            _ => {}
        }
    }

    fn walk_function(&mut self, func: &ast::Function) {
        if let FunctionArguments::List(list) = &func.args {
            for arg in &list.args {
                if let FunctionArg::Unnamed(FunctionArgExpr::Expr(expr))
                | FunctionArg::Named {
                    arg: FunctionArgExpr::Expr(expr),
                    ..
                } = arg
                {
                    self.walk_expr(expr);
                }
            }
        }
    }

    /// `$1::boolean` and `$1::blob` carry their coercion as the argument
    /// name; other casts are transparent.
    fn walk_cast(&mut self, inner: &Expr, data_type: &ast::DataType) {
        if let Expr::Value(value) = inner {
            if let ast::Value::Placeholder(marker) = &value.value {
                self.register_placeholder(marker);
                let name = match data_type.to_string().to_ascii_lowercase().as_str() {
                    "boolean" | "bool" => "boolean",
                    "blob" | "bytea" => "blob",
                    _ => "",
                };
                self.arg_columns.push(name.to_string());
                return;
            }
        }
        self.walk_expr(inner);
    }

    fn set_command(&mut self, command: Command) {
        if self.command == Command::Unknown {
            self.command = command;
        }
    }

    fn record_table(&mut self, name: &ObjectName) {
        let name = name.to_string();
        if !self.tables.contains(&name) {
            self.tables.push(name);
        }
    }

    fn open_scope(&mut self) -> bool {
        if self.scope_open {
            false
        } else {
            self.scope_open = true;
            true
        }
    }

    fn close_scope(&mut self) {
        self.scope_open = false;
        self.expr_columns.clear();
    }

    fn on_column(&mut self, name: &str) {
        if self.scope_open {
            self.expr_columns.push(name.to_string());
        }
    }

    fn register_placeholder(&mut self, marker: &str) -> usize {
        let index = marker
            .strip_prefix('$')
            .and_then(|n| n.parse::<usize>().ok())
            .unwrap_or_else(|| {
                self.next_ordinal += 1;
                self.next_ordinal
            });
        self.max_param = self.max_param.max(index);
        index
    }

    fn on_placeholder(&mut self, marker: &str) {
        let index = self.register_placeholder(marker);

        // A placeholder inside an open comparison binds to the column on
        // the other side; otherwise INSERT/UPDATE bind positionally.
        if self.scope_open && !self.expr_columns.is_empty() {
            if let Some(last) = self.expr_columns.last() {
                self.arg_columns.push(last.clone());
            }
        } else if matches!(self.command, Command::Insert | Command::Update)
            && !self.target_columns.is_empty()
        {
            if let Some(column) = self.target_columns.get(index.saturating_sub(1)) {
                self.arg_columns.push(column.clone());
            } else {
                self.arg_columns.push(String::new());
            }
        } else {
            self.arg_columns.push(String::new());
        }
    }
}

fn last_ident(name: &ObjectName) -> String {
    name.0
        .last()
        .map(|part| part.to_string())
        .unwrap_or_default()
}
