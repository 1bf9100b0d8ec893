//! Integration tests for the statement gate.
//!
//! These tests verify that the validator enforces the read-only policy:
//! single statements only, leading keyword checks, and the denylist.

use mssql_mcp_server::error::DbError;
use mssql_mcp_server::tools::validator::{DEFAULT_DENYLIST, StatementValidator};

fn gate() -> StatementValidator {
    StatementValidator::new()
}

/// A plain SELECT passes in read-only mode.
#[test]
fn test_select_approved() {
    let result = gate().check("SELECT * FROM Customers WHERE id = 1", false);
    assert!(result.is_ok(), "SELECT should be approved");
}

/// A SELECT with joins, subqueries, and aliases still passes; the gate
/// only looks at tokens, never at query structure.
#[test]
fn test_complex_select_approved() {
    let sql = r#"
        SELECT c.name, o.total,
               (SELECT COUNT(*) FROM Orders o2 WHERE o2.customer_id = c.id) AS order_count
        FROM Customers c
        JOIN Orders o ON o.customer_id = c.id
        WHERE o.placed_at > '2024-01-01'
        ORDER BY o.total DESC
    "#;
    assert!(gate().check(sql, false).is_ok());
}

/// An injected second statement is rejected and the reason says why.
#[test]
fn test_multi_statement_batch_rejected() {
    let result = gate().check("SELECT * FROM Customers; DROP TABLE Customers;", false);
    let err = result.unwrap_err();
    assert!(matches!(err, DbError::ValidationRejected { .. }));
    assert!(
        err.to_string().contains("multi-statement"),
        "reason should name the rule: {err}"
    );
}

/// One trailing semicolon is tolerated and stripped from the statement.
#[test]
fn test_trailing_semicolon_tolerated() {
    let normalized = gate().check("SELECT 1;", false).unwrap();
    assert_eq!(normalized, "SELECT 1");
}

/// Semicolons inside string literals are data, not statement terminators.
#[test]
fn test_semicolon_in_literal_not_a_terminator() {
    assert!(gate().check("SELECT 'a;b;c' AS path", false).is_ok());
}

/// Semicolons inside comments are not statement terminators either.
#[test]
fn test_semicolon_in_comment_not_a_terminator() {
    assert!(gate().check("SELECT 1 -- done; really\n", false).is_ok());
}

/// Empty and blank statements are rejected outright.
#[test]
fn test_empty_statements_rejected() {
    for sql in ["", "   ", "\n\t", ";"] {
        let err = gate().check(sql, false).unwrap_err();
        assert!(
            err.to_string().contains("empty"),
            "{sql:?} should be rejected as empty"
        );
    }
}

/// Every default write keyword is refused without write mode, with the
/// distinct write_disabled kind the dispatcher maps to invalid params.
#[test]
fn test_write_keywords_blocked_in_read_only_mode() {
    let statements = [
        "INSERT INTO t (id) VALUES (1)",
        "UPDATE t SET x = 1 WHERE id = 1",
        "DELETE FROM t WHERE id = 1",
    ];
    for sql in statements {
        let err = gate().check(sql, false).unwrap_err();
        assert!(
            matches!(err, DbError::WriteDisabled { .. }),
            "{sql} should be write_disabled, got {err:?}"
        );
        assert_eq!(err.kind(), "write_disabled");
    }
}

/// The same write statements pass once write mode is on.
#[test]
fn test_write_keywords_allowed_in_write_mode() {
    assert!(gate().check("INSERT INTO t (id) VALUES (1)", true).is_ok());
    assert!(gate().check("UPDATE t SET x = 1 WHERE id = 1", true).is_ok());
    assert!(gate().check("DELETE FROM t WHERE id = 1", true).is_ok());
}

/// Denylisted keywords are rejected wherever they appear, in any case,
/// and in both modes.
#[test]
fn test_denylist_applies_in_both_modes() {
    for keyword in DEFAULT_DENYLIST {
        let sql = format!("SELECT * FROM t WHERE c = {}", keyword.to_lowercase());
        for write_enabled in [false, true] {
            let err = gate().check(&sql, write_enabled).unwrap_err();
            assert!(
                err.to_string().contains(*keyword),
                "{keyword} should be rejected (write_enabled={write_enabled}): {err}"
            );
        }
    }
}

/// DDL as the leading keyword is rejected even in write mode.
#[test]
fn test_ddl_rejected_even_in_write_mode() {
    for sql in [
        "DROP TABLE Customers",
        "TRUNCATE TABLE Customers",
        "ALTER TABLE Customers ADD x INT",
        "CREATE TABLE t (id INT)",
        "GRANT SELECT ON t TO someone",
    ] {
        assert!(gate().check(sql, true).is_err(), "{sql} should be rejected");
    }
}

/// Identifiers that merely contain a denylisted word are fine. Matching
/// is whole-token, not substring.
#[test]
fn test_no_substring_false_positives() {
    for sql in [
        "SELECT * FROM dropped_orders",
        "SELECT exec_count FROM job_stats",
        "SELECT * FROM grants_history",
        "SELECT truncated FROM results",
    ] {
        assert!(gate().check(sql, false).is_ok(), "{sql} should be approved");
    }
}

/// A denylisted word inside a string literal is data.
#[test]
fn test_denylisted_word_in_literal_approved() {
    assert!(
        gate()
            .check("SELECT 'how to DROP a table safely' AS title", false)
            .is_ok()
    );
}

/// Keywords the policy does not know stay rejected: MERGE writes rows and
/// WITH can prefix one, so neither is in the default read set.
#[test]
fn test_unlisted_leading_keywords_rejected() {
    for sql in [
        "MERGE INTO t USING s ON t.id = s.id WHEN MATCHED THEN UPDATE SET x = 1",
        "WITH cte AS (SELECT 1 AS n) SELECT n FROM cte",
        "BEGIN TRANSACTION",
        "USE master",
    ] {
        let err = gate().check(sql, false).unwrap_err();
        assert!(
            matches!(err, DbError::ValidationRejected { .. }),
            "{sql} should be rejected"
        );
    }
}

/// EXEC is unreachable through the gate from any angle: leading, embedded,
/// or via its long form.
#[test]
fn test_every_exec_spelling_rejected() {
    for sql in [
        "EXEC sp_who",
        "EXECUTE sp_who",
        "SELECT 1; EXEC xp_cmdshell 'dir'",
        "SELECT * FROM t WHERE c = EXEC",
    ] {
        assert!(gate().check(sql, true).is_err(), "{sql} should be rejected");
    }
}

/// Verdicts carry the normalized statement when approved and the rule
/// that fired when rejected.
#[test]
fn test_verdict_shapes() {
    let approved = gate().validate("  SELECT 1;  ", false);
    assert!(approved.approved);
    assert!(approved.reason.is_none());
    assert_eq!(approved.statement, "SELECT 1");

    let rejected = gate().validate("DROP TABLE t", false);
    assert!(!rejected.approved);
    assert!(rejected.reason.unwrap().contains("leading keyword"));
}

/// check_write admits only write statements; reads are pointed back at
/// the query tool.
#[test]
fn test_check_write_routes_reads_away() {
    assert!(gate().check_write("DELETE FROM t WHERE id = 1").is_ok());

    let err = gate().check_write("SELECT 1").unwrap_err();
    assert!(err.to_string().contains("mssql_query"));

    let verdict = gate().validate_write("UPDATE t SET x = 1");
    assert!(verdict.approved);
}

/// Rejections surface as MCP invalid_params so agents treat them as
/// caller errors rather than server faults.
#[test]
fn test_rejection_maps_to_invalid_params() {
    let err = gate().check("DROP TABLE t", false).unwrap_err();
    let mcp_err: rmcp::ErrorData = err.into();
    assert_eq!(mcp_err.code.0, -32602);
}
