//! SQL query rewriting for the multi-tenant backend.
//!
//! The remote store keeps every tenant's tables in one database per tenant,
//! with the logical schema flattened into the table name. Incoming queries
//! are parsed (with the sqlparser bundled in DataFusion) and every two-part
//! table or column reference is replaced by its tenant-qualified physical
//! form. References through a query's own aliases (CTE names, table
//! aliases) stay untouched, as do function calls. Bare table references are
//! coerced into the `default` schema first.
//!
//! Parsing is best-effort: when the text cannot be parsed the original
//! query is returned with the error embedded as a leading comment, and the
//! caller runs it as-is.

use std::collections::HashSet;

use datafusion::sql::sqlparser::ast::{
    Expr, Ident, Join, JoinConstraint, JoinOperator, ObjectName, Query, Select, SelectItem,
    SetExpr, Statement, TableFactor,
};
use datafusion::sql::sqlparser::dialect::GenericDialect;
use datafusion::sql::sqlparser::parser::Parser;

use meld_core::{CoreError, SignalKind, TableHandle, SCHEMA_SEP};

/// A CREATE/DROP discovered inside raw SQL, to be re-announced as a signal
/// after the statement runs.
#[derive(Debug, Clone)]
pub struct CapturedDdl {
    pub kind: SignalKind,
    /// Logical `schema.table` text as written in the query.
    pub table: String,
}

/// Result of a rewrite pass.
#[derive(Debug, Clone)]
pub struct RewriteOutcome {
    pub sql: String,
    /// Tables the query referenced, in their logical form.
    pub referenced: Vec<TableHandle>,
    pub ddl: Vec<CapturedDdl>,
}

/// What the rewrite pass does to table references.
#[derive(Debug, Clone)]
enum Mode {
    /// Replace two-part references with tenant-qualified physical names.
    Tenant { tenant_db: String },
    /// Record references only, leave the text alone.
    Intel,
    /// Qualify bare references with an adapter schema; qualified references
    /// are an error.
    Qualify { schema: String },
}

/// Rewrite a query for the tenant database. Never fails; parse problems
/// degrade to a commented passthrough.
pub fn rewrite_for_tenant(sql: &str, tenant_db: &str) -> RewriteOutcome {
    transform(
        sql,
        Mode::Tenant {
            tenant_db: tenant_db.to_string(),
        },
    )
}

/// Parse a query only to discover referenced tables and raw DDL, leaving
/// the text unchanged.
pub fn query_intel(sql: &str) -> RewriteOutcome {
    let mut outcome = transform(sql, Mode::Intel);
    outcome.sql = sql.to_string();
    outcome
}

/// Qualify every bare table reference in an adapter parameter query with
/// the adapter's schema. Unlike the tenant rewrite this one is strict:
/// unparseable text and already-qualified references are errors.
pub fn qualify_adapter_query(sql: &str, schema: &str) -> Result<RewriteOutcome, CoreError> {
    let dialect = GenericDialect {};
    Parser::parse_sql(&dialect, sql)
        .map_err(|e| CoreError::QuerySyntax(format!("cannot parse adapter query: {e}")))?;
    let outcome = transform(
        sql,
        Mode::Qualify {
            schema: schema.to_string(),
        },
    );
    for table in &outcome.referenced {
        if table.schema() != schema {
            return Err(CoreError::QuerySyntax(format!(
                "adapter queries cannot use qualified table names: {}. Query: {sql}",
                table.user_name()
            )));
        }
    }
    Ok(outcome)
}

fn transform(sql: &str, mode: Mode) -> RewriteOutcome {
    let dialect = GenericDialect {};
    let mut statements = match Parser::parse_sql(&dialect, sql) {
        Ok(statements) => statements,
        Err(e) => {
            return RewriteOutcome {
                sql: format!("/* sql rewrite failed: {e} */ {sql}"),
                referenced: Vec::new(),
                ddl: Vec::new(),
            }
        }
    };

    let mut rewriter = Rewriter {
        mode,
        aliases: HashSet::new(),
        referenced: Vec::new(),
        ddl: Vec::new(),
    };
    for statement in &statements {
        rewriter.collect_aliases_statement(statement);
    }
    for statement in &mut statements {
        rewriter.rewrite_statement(statement);
    }

    let rendered: Vec<String> = statements.iter().map(render_statement).collect();
    RewriteOutcome {
        sql: rendered.join("; "),
        referenced: rewriter.referenced,
        ddl: rewriter.ddl,
    }
}

/// Render a statement, appending a storage engine to CREATE TABLE
/// statements that do not already carry one.
fn render_statement(statement: &Statement) -> String {
    let mut sql = statement.to_string();
    let lower = sql.to_lowercase();
    if lower.starts_with("create table") && !lower.contains("engine") {
        sql.push_str(" ENGINE = MergeTree()");
    }
    sql
}

struct Rewriter {
    mode: Mode,
    aliases: HashSet<String>,
    referenced: Vec<TableHandle>,
    ddl: Vec<CapturedDdl>,
}

impl Rewriter {
    // ------------------------------------------------------------------
    // alias discovery
    // ------------------------------------------------------------------

    fn collect_aliases_statement(&mut self, statement: &Statement) {
        match statement {
            Statement::Query(query) => self.collect_aliases_query(query),
            Statement::Insert(insert) => {
                if let Some(source) = &insert.source {
                    self.collect_aliases_query(source);
                }
            }
            Statement::CreateTable(create) => {
                if let Some(query) = &create.query {
                    self.collect_aliases_query(query);
                }
            }
            _ => {}
        }
    }

    fn collect_aliases_query(&mut self, query: &Query) {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.aliases.insert(cte.alias.name.value.clone());
                self.collect_aliases_query(&cte.query);
            }
        }
        self.collect_aliases_set_expr(&query.body);
    }

    fn collect_aliases_set_expr(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => {
                for twj in &select.from {
                    self.collect_aliases_factor(&twj.relation);
                    for join in &twj.joins {
                        self.collect_aliases_factor(&join.relation);
                    }
                }
            }
            SetExpr::Query(query) => self.collect_aliases_query(query),
            SetExpr::SetOperation { left, right, .. } => {
                self.collect_aliases_set_expr(left);
                self.collect_aliases_set_expr(right);
            }
            _ => {}
        }
    }

    fn collect_aliases_factor(&mut self, factor: &TableFactor) {
        match factor {
            TableFactor::Table { alias, .. } => {
                if let Some(alias) = alias {
                    self.aliases.insert(alias.name.value.clone());
                }
            }
            TableFactor::Derived { subquery, alias, .. } => {
                if let Some(alias) = alias {
                    self.aliases.insert(alias.name.value.clone());
                }
                self.collect_aliases_query(subquery);
            }
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => {
                self.collect_aliases_factor(&table_with_joins.relation);
                for join in &table_with_joins.joins {
                    self.collect_aliases_factor(&join.relation);
                }
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // rewriting
    // ------------------------------------------------------------------

    fn rewrite_statement(&mut self, statement: &mut Statement) {
        match statement {
            Statement::Query(query) => self.rewrite_query(query),
            Statement::Insert(insert) => {
                self.rewrite_relation(&mut insert.table_name);
                if let Some(source) = &mut insert.source {
                    self.rewrite_query(source);
                }
            }
            Statement::CreateTable(create) => {
                self.ddl.push(CapturedDdl {
                    kind: SignalKind::TableCreate,
                    table: object_name_text(&create.name),
                });
                self.rewrite_relation(&mut create.name);
                if let Some(query) = &mut create.query {
                    self.rewrite_query(query);
                }
            }
            Statement::Drop { names, .. } => {
                if let Some(first) = names.first() {
                    self.ddl.push(CapturedDdl {
                        kind: SignalKind::TableDrop,
                        table: object_name_text(first),
                    });
                }
                for name in names.iter_mut() {
                    self.rewrite_relation(name);
                }
            }
            _ => {}
        }
    }

    fn rewrite_query(&mut self, query: &mut Query) {
        if let Some(with) = &mut query.with {
            for cte in &mut with.cte_tables {
                self.rewrite_query(&mut cte.query);
            }
        }
        self.rewrite_set_expr(&mut query.body);
    }

    fn rewrite_set_expr(&mut self, body: &mut SetExpr) {
        match body {
            SetExpr::Select(select) => self.rewrite_select(select),
            SetExpr::Query(query) => self.rewrite_query(query),
            SetExpr::SetOperation { left, right, .. } => {
                self.rewrite_set_expr(left);
                self.rewrite_set_expr(right);
            }
            _ => {}
        }
    }

    fn rewrite_select(&mut self, select: &mut Select) {
        for twj in &mut select.from {
            self.rewrite_factor(&mut twj.relation);
            for join in &mut twj.joins {
                self.rewrite_join(join);
            }
        }
        for item in &mut select.projection {
            match item {
                SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                    self.rewrite_expr(expr)
                }
                _ => {}
            }
        }
        if let Some(selection) = &mut select.selection {
            self.rewrite_expr(selection);
        }
        if let Some(having) = &mut select.having {
            self.rewrite_expr(having);
        }
    }

    fn rewrite_join(&mut self, join: &mut Join) {
        self.rewrite_factor(&mut join.relation);
        let constraint = match &mut join.join_operator {
            JoinOperator::Inner(c)
            | JoinOperator::LeftOuter(c)
            | JoinOperator::RightOuter(c)
            | JoinOperator::FullOuter(c) => Some(c),
            _ => None,
        };
        if let Some(JoinConstraint::On(expr)) = constraint {
            self.rewrite_expr(expr);
        }
    }

    fn rewrite_factor(&mut self, factor: &mut TableFactor) {
        match factor {
            TableFactor::Table { name, .. } => self.rewrite_relation(name),
            TableFactor::Derived { subquery, .. } => self.rewrite_query(subquery),
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => {
                self.rewrite_factor(&mut table_with_joins.relation);
                for join in table_with_joins.joins.iter_mut() {
                    self.rewrite_join(join);
                }
            }
            _ => {}
        }
    }

    fn rewrite_expr(&mut self, expr: &mut Expr) {
        match expr {
            Expr::CompoundIdentifier(idents) => {
                if idents.len() == 2 && !self.aliases.contains(&idents[0].value) {
                    if let Some(rewritten) = self.physical_parts(&idents[0].value, &idents[1].value)
                    {
                        *idents = rewritten;
                    }
                }
            }
            Expr::BinaryOp { left, right, .. } => {
                self.rewrite_expr(left);
                self.rewrite_expr(right);
            }
            Expr::UnaryOp { expr, .. } => self.rewrite_expr(expr),
            Expr::Nested(inner) => self.rewrite_expr(inner),
            Expr::IsNull(inner) | Expr::IsNotNull(inner) => self.rewrite_expr(inner),
            Expr::InList { expr, list, .. } => {
                self.rewrite_expr(expr);
                for item in list.iter_mut() {
                    self.rewrite_expr(item);
                }
            }
            Expr::InSubquery { expr, subquery, .. } => {
                self.rewrite_expr(expr);
                self.rewrite_query(subquery);
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                self.rewrite_expr(expr);
                self.rewrite_expr(low);
                self.rewrite_expr(high);
            }
            Expr::Subquery(query) => self.rewrite_query(query),
            Expr::Exists { subquery, .. } => self.rewrite_query(subquery),
            // Function calls are intentionally left alone
            _ => {}
        }
    }

    /// Rewrite a relation reference (FROM/INSERT/CREATE/DROP position).
    fn rewrite_relation(&mut self, name: &mut ObjectName) {
        let parts: Vec<String> = name.0.iter().map(|ident| ident.value.clone()).collect();
        let default_schema = match &self.mode {
            Mode::Qualify { schema } => schema.clone(),
            _ => "default".to_string(),
        };
        let (schema, table) = match parts.len() {
            // Coerce bare references into the default schema
            1 => (default_schema, parts[0].clone()),
            2 => (parts[0].clone(), parts[1].clone()),
            _ => return,
        };
        if parts.len() == 1 && self.aliases.contains(&table) {
            return;
        }
        if parts.len() == 2 && self.aliases.contains(&schema) {
            return;
        }
        if let Ok(handle) = TableHandle::new(&table, Some(&schema)) {
            self.referenced.push(handle);
        }
        match self.physical_parts(&schema, &table) {
            Some(rewritten) => name.0 = rewritten,
            None => {
                if matches!(self.mode, Mode::Qualify { .. }) && parts.len() == 1 {
                    name.0 = vec![Ident::new(schema), Ident::new(table)];
                }
            }
        }
    }

    /// Tenant-qualified identifier parts, or None outside tenant mode.
    fn physical_parts(&self, schema: &str, table: &str) -> Option<Vec<Ident>> {
        match &self.mode {
            Mode::Tenant { tenant_db } => Some(vec![
                Ident::new(tenant_db.clone()),
                Ident::new(format!("{schema}{SCHEMA_SEP}{table}")),
            ]),
            _ => None,
        }
    }
}

fn object_name_text(name: &ObjectName) -> String {
    name.0
        .iter()
        .map(|ident| ident.value.clone())
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_part_table_rewritten() {
        let out = rewrite_for_tenant("SELECT * FROM sales.orders", "tenant_u1");
        assert!(out.sql.contains("tenant_u1.sales____orders"));
        assert_eq!(out.referenced.len(), 1);
        assert_eq!(out.referenced[0].user_name(), "sales.orders");
    }

    #[test]
    fn test_bare_table_coerced_to_default_schema() {
        let out = rewrite_for_tenant("SELECT * FROM orders", "tenant_u1");
        assert!(out.sql.contains("tenant_u1.default____orders"));
        assert_eq!(out.referenced[0].user_name(), "default.orders");
    }

    #[test]
    fn test_cte_alias_left_untouched() {
        let out = rewrite_for_tenant(
            "WITH recent AS (SELECT * FROM sales.orders) SELECT * FROM recent",
            "tenant_u1",
        );
        assert!(out.sql.contains("tenant_u1.sales____orders"));
        assert!(!out.sql.contains("default____recent"));
        assert!(!out.sql.contains("tenant_u1.recent"));
    }

    #[test]
    fn test_table_alias_columns_left_untouched() {
        let out = rewrite_for_tenant(
            "SELECT o.id FROM sales.orders o WHERE o.total > 5",
            "tenant_u1",
        );
        assert!(out.sql.contains("tenant_u1.sales____orders"));
        assert!(out.sql.contains("o.id"));
        assert!(out.sql.contains("o.total"));
    }

    #[test]
    fn test_join_relations_rewritten() {
        let out = rewrite_for_tenant(
            "SELECT a.id FROM sales.orders a JOIN crm.users b ON a.uid = b.id",
            "tenant_u1",
        );
        assert!(out.sql.contains("tenant_u1.sales____orders"));
        assert!(out.sql.contains("tenant_u1.crm____users"));
    }

    #[test]
    fn test_parse_failure_degrades_to_comment() {
        let out = rewrite_for_tenant("SELEKT ?? FRUM", "tenant_u1");
        assert!(out.sql.starts_with("/* sql rewrite failed:"));
        assert!(out.sql.ends_with("SELEKT ?? FRUM"));
        assert!(out.referenced.is_empty());
    }

    #[test]
    fn test_create_table_gets_engine_and_captured() {
        let out = rewrite_for_tenant("CREATE TABLE sales.staging (id INT)", "tenant_u1");
        assert!(out.sql.contains("tenant_u1.sales____staging"));
        assert!(out.sql.contains("ENGINE = MergeTree()"));
        assert_eq!(out.ddl.len(), 1);
        assert_eq!(out.ddl[0].kind, SignalKind::TableCreate);
        assert_eq!(out.ddl[0].table, "sales.staging");
    }

    #[test]
    fn test_drop_table_captured() {
        let out = rewrite_for_tenant("DROP TABLE sales.staging", "tenant_u1");
        assert_eq!(out.ddl.len(), 1);
        assert_eq!(out.ddl[0].kind, SignalKind::TableDrop);
        assert_eq!(out.ddl[0].table, "sales.staging");
    }

    #[test]
    fn test_function_calls_ignored() {
        let out = rewrite_for_tenant("SELECT count(x.y) FROM sales.orders", "tenant_u1");
        assert!(out.sql.contains("count"));
        // the argument inside the function call is not tenant-qualified
        assert!(!out.sql.contains("x____y"));
    }

    #[test]
    fn test_query_intel_leaves_sql_unchanged() {
        let sql = "SELECT * FROM sales.orders";
        let out = query_intel(sql);
        assert_eq!(out.sql, sql);
        assert_eq!(out.referenced[0].user_name(), "sales.orders");
    }

    #[test]
    fn test_qualify_bare_reference() {
        let out = qualify_adapter_query("SELECT id FROM repos", "github").unwrap();
        assert!(out.sql.contains("github.repos"));
        assert_eq!(out.referenced[0].user_name(), "github.repos");
    }

    #[test]
    fn test_qualify_rejects_qualified_reference() {
        let err = qualify_adapter_query("SELECT id FROM other.repos", "github").unwrap_err();
        assert!(matches!(err, CoreError::QuerySyntax(_)));
    }

    #[test]
    fn test_qualify_rejects_unparseable() {
        assert!(qualify_adapter_query("NOT SQL AT ALL ;;", "github").is_err());
    }

    #[test]
    fn test_insert_target_rewritten() {
        let out = rewrite_for_tenant(
            "INSERT INTO sales.orders SELECT * FROM sales.staging",
            "tenant_u1",
        );
        assert!(out.sql.contains("tenant_u1.sales____orders"));
        assert!(out.sql.contains("tenant_u1.sales____staging"));
    }
}
