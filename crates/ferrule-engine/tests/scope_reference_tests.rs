//! Handle Scope and Reference Tests
//!
//! Lifetime rules for host values held by managed code:
//! - Strict nesting of plain and escapable scopes
//! - Single escape per escapable scope
//! - Stale handles and out-of-order closes abort
//! - Reference counts, weak references and collection
//!
//! # Running Tests
//! ```bash
//! cargo test --test scope_reference_tests
//! ```

use ferrule_engine::{BridgeError, BridgeOptions, Env, Handle};

fn env() -> Env {
    let _ = env_logger::builder().is_test(true).try_init();
    Env::new(BridgeOptions::default().worker_threads(1))
}

// ===== Scope Nesting =====

#[test]
fn test_nested_scopes_close_innermost_first() {
    let env = env();
    let outer = env.open_scope();
    let inner = env.open_escapable_scope();
    let innermost = env.open_scope();
    assert_eq!(env.scope_depth(), 3);

    env.close_scope(innermost);
    env.close_escapable_scope(inner);
    env.close_scope(outer);
    assert_eq!(env.scope_depth(), 0);
}

#[test]
#[should_panic(expected = "closed out of order")]
fn test_out_of_order_close_aborts() {
    let env = env();
    let outer = env.open_scope();
    let _inner = env.open_scope();
    env.close_scope(outer);
}

#[test]
#[should_panic(expected = "outside of any handle scope")]
fn test_handle_without_scope_aborts() {
    let env = env();
    env.create_number(1.0);
}

#[test]
#[should_panic(expected = "stale handle")]
fn test_stale_handle_aborts() {
    let env = env();
    let outer = env.open_scope();
    let inner = env.open_scope();
    let stale = env.create_string("short-lived");
    env.close_scope(inner);

    let _ = env.get_value_string(stale);
    env.close_scope(outer);
}

#[test]
fn test_handles_of_closed_scope_are_collectable() {
    let env = env();
    let outer = env.open_scope();
    let inner = env.open_scope();
    for _ in 0..16 {
        env.create_object();
    }
    env.close_scope(inner);

    let stats = env.collect_garbage();
    assert_eq!(stats.last_freed, 16);
    env.close_scope(outer);
}

// ===== Escape =====

fn make_point(env: &Env) -> Handle {
    let scope = env.open_escapable_scope();
    let point = env.create_object();
    let x = env.create_number(3.0);
    env.set_named_property(point, "x", x).unwrap();
    let escaped = env.escape_handle(&scope, point).unwrap();
    env.close_escapable_scope(scope);
    escaped
}

#[test]
fn test_escaped_handle_outlives_scope() {
    let env = env();
    env.run_in_scope(|env| {
        let point = make_point(env);
        env.collect_garbage();

        let x = env.get_named_property(point, "x").unwrap();
        assert_eq!(env.get_value_number(x).unwrap(), 3.0);
    });
}

#[test]
fn test_escape_twice_promotes_nothing() {
    let env = env();
    env.run_in_scope(|env| {
        let scope = env.open_escapable_scope();
        let first = env.create_object();
        let second = env.create_object();

        assert!(env.escape_handle(&scope, first).is_ok());
        assert!(matches!(
            env.escape_handle(&scope, second),
            Err(BridgeError::EscapeCalledTwice)
        ));
        env.close_escapable_scope(scope);

        // Only the first object is rooted by the parent scope
        let stats = env.collect_garbage();
        assert_eq!(stats.last_freed, 1);
    });
}

#[test]
fn test_escape_without_parent_fails() {
    let env = env();
    let scope = env.open_escapable_scope();
    let value = env.create_number(1.0);
    assert!(matches!(
        env.escape_handle(&scope, value),
        Err(BridgeError::InvalidArg(_))
    ));
    env.close_escapable_scope(scope);
}

// ===== References =====

#[test]
fn test_reference_counting() {
    let env = env();
    env.run_in_scope(|env| {
        let obj = env.create_object();
        let reference = env.create_reference(obj, 1);

        assert_eq!(env.reference_ref(&reference), 2);
        assert_eq!(env.reference_unref(&reference).unwrap(), 1);
        assert_eq!(env.reference_unref(&reference).unwrap(), 0);
        assert!(matches!(
            env.reference_unref(&reference),
            Err(BridgeError::InvalidArg(_))
        ));
        assert_eq!(env.reference_count(&reference), 0);
        env.delete_reference(reference);
    });
    assert_eq!(env.reference_table_len(), 0);
}

#[test]
fn test_strong_reference_survives_scopes() {
    let env = env();
    let reference = env.run_in_scope(|env| {
        let obj = env.create_object();
        let tag = env.create_string("kept");
        env.set_named_property(obj, "tag", tag).unwrap();
        env.create_reference(obj, 1)
    });

    env.collect_garbage();
    env.run_in_scope(|env| {
        let obj = env.get_reference_value(&reference).expect("strongly held");
        let tag = env.get_named_property(obj, "tag").unwrap();
        assert_eq!(env.get_value_string(tag).unwrap(), "kept");
    });
    env.run_in_scope(|env| env.delete_reference(reference));
}

#[test]
fn test_weak_reference_observes_collection() {
    let env = env();
    let reference = env.run_in_scope(|env| {
        let obj = env.create_object();
        env.create_reference(obj, 0)
    });

    env.run_in_scope(|env| {
        assert!(env.get_reference_value(&reference).is_some());
    });
    env.collect_garbage();
    env.run_in_scope(|env| {
        assert!(env.get_reference_value(&reference).is_none());
        env.delete_reference(reference);
    });
}

#[test]
fn test_reference_to_primitive_never_empties() {
    let env = env();
    let reference = env.run_in_scope(|env| {
        let n = env.create_number(9.0);
        env.create_reference(n, 0)
    });
    env.collect_garbage();
    env.run_in_scope(|env| {
        let n = env.get_reference_value(&reference).unwrap();
        assert_eq!(env.get_value_number(n).unwrap(), 9.0);
        env.delete_reference(reference);
    });
}

#[test]
fn test_weakened_reference_releases_object() {
    let env = env();
    let reference = env.run_in_scope(|env| {
        let obj = env.create_object();
        env.create_reference(obj, 1)
    });
    env.collect_garbage();
    env.run_in_scope(|env| assert!(env.get_reference_value(&reference).is_some()));

    env.reference_unref(&reference).unwrap();
    env.collect_garbage();
    env.run_in_scope(|env| assert!(env.get_reference_value(&reference).is_none()));
    env.delete_reference(reference);
}
