//! obscore-sanitizer
//!
//! Pure transformer: `(value, policy) -> sanitized value`. Tolerates
//! cycles, deep nesting, and polymorphic container shapes (see
//! `SPEC_FULL.md` §4.2 for the full algorithm).

mod policy;
pub mod value;

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

pub use policy::{MaskingPolicy, MaskingRule, Mode, SanitizerError};
pub use value::{Node, NodeId, ValueArena};

const MAX_DEPTH_MARKER: &str = "[MAX_DEPTH_EXCEEDED]";
const CIRCULAR_MARKER: &str = "[CIRCULAR]";
const ACCESSOR_ERROR_MARKER: &str = "[Error accessing property]";

pub struct Sanitizer {
    policy: RwLock<Arc<MaskingPolicy>>,
}

impl Sanitizer {
    pub fn new(policy: MaskingPolicy) -> Result<Self, SanitizerError> {
        policy.validate()?;
        Ok(Self { policy: RwLock::new(Arc::new(policy)) })
    }

    /// Snapshot the policy pointer so in-flight sanitizations are unaffected
    /// by a concurrent `set_policy` (§9's "mutable policy under concurrent
    /// traversal" design note).
    fn snapshot(&self) -> Arc<MaskingPolicy> {
        self.policy.read().expect("policy lock poisoned").clone()
    }

    /// Replace the whole policy atomically; never mutate a rule in place.
    pub fn set_policy(&self, policy: MaskingPolicy) -> Result<(), SanitizerError> {
        policy.validate()?;
        *self.policy.write().expect("policy lock poisoned") = Arc::new(policy);
        Ok(())
    }

    pub fn set_max_depth(&self, max_depth: usize) {
        let mut current = (*self.snapshot()).clone();
        current.max_depth = max_depth;
        *self.policy.write().expect("policy lock poisoned") = Arc::new(current);
    }

    pub fn add_rule(&self, rule: MaskingRule) -> Result<(), SanitizerError> {
        let mut next = (*self.snapshot()).clone();
        next.add_custom_rule(rule)?;
        *self.policy.write().expect("policy lock poisoned") = Arc::new(next);
        Ok(())
    }

    pub fn remove_rule(&self, name: &str) -> bool {
        let mut next = (*self.snapshot()).clone();
        let removed = next.remove_rule(name);
        if removed {
            *self.policy.write().expect("policy lock poisoned") = Arc::new(next);
        }
        removed
    }

    pub fn toggle_rule(&self, name: &str, enabled: bool) -> bool {
        let mut next = (*self.snapshot()).clone();
        let found = next.toggle_rule(name, enabled);
        if found {
            *self.policy.write().expect("policy lock poisoned") = Arc::new(next);
        }
        found
    }

    /// Sanitize the subgraph reachable from `root` in `input`, returning a
    /// fresh, independent arena (the input is never mutated).
    pub fn sanitize(&self, input: &ValueArena, root: NodeId) -> (ValueArena, NodeId) {
        let policy = self.snapshot();
        if policy.is_identity() {
            return input.deep_copy(root);
        }
        let mut out = ValueArena::new();
        let mut visited = HashSet::new();
        let new_root = sanitize_node(&policy, input, root, 0, &mut visited, &mut out);
        (out, new_root)
    }

    /// Convenience wrapper for the common case: metadata already shaped as
    /// `serde_json::Value`.
    pub fn sanitize_json(&self, value: &serde_json::Value) -> serde_json::Value {
        let (arena, root) = ValueArena::from_json(value);
        let (out, out_root) = self.sanitize(&arena, root);
        out.to_json(out_root)
    }

    /// Same traversal as `sanitize`, short-circuited on the first hit.
    pub fn contains_pii(&self, input: &ValueArena, root: NodeId) -> bool {
        let policy = self.snapshot();
        if policy.is_identity() {
            return false;
        }
        let mut visited = HashSet::new();
        contains_pii_node(&policy, input, root, 0, &mut visited)
    }

    pub fn contains_pii_json(&self, value: &serde_json::Value) -> bool {
        let (arena, root) = ValueArena::from_json(value);
        self.contains_pii(&arena, root)
    }

    pub fn sanitize_email(&self, email: &str) -> String {
        sanitize_email(email)
    }

    pub fn sanitize_phone(&self, phone: &str) -> String {
        sanitize_phone(phone)
    }

    pub fn sanitize_credit_card(&self, card: &str) -> String {
        sanitize_credit_card(card)
    }
}

fn sanitize_node(
    policy: &MaskingPolicy,
    src: &ValueArena,
    id: NodeId,
    depth: usize,
    visited: &mut HashSet<usize>,
    out: &mut ValueArena,
) -> NodeId {
    if depth > policy.max_depth {
        return out.push_string(MAX_DEPTH_MARKER);
    }

    match src.get(id).clone() {
        Node::Null => out.push(Node::Null),
        Node::Bool(b) => out.push(Node::Bool(b)),
        Node::Number(n) => out.push(Node::Number(n)),
        Node::String(s) => out.push_string(sanitize_string(policy, &s)),
        Node::Function => out.push_string("[Function]"),
        Node::Date(s) => out.push(Node::Date(s)),
        Node::Regex(s) => out.push(Node::Regex(s)),
        Node::Bytes(_) => out.push_string("[Binary Data]"),
        Node::Promise => out.push_string("[Promise]"),
        Node::WeakCollection(tag) => out.push_string(format!("[{tag}]")),
        Node::Poisoned => out.push_string(ACCESSOR_ERROR_MARKER),

        Node::Error { name, message, stack } => {
            if !visited.insert(id.0) {
                return out.push_string(CIRCULAR_MARKER);
            }
            let message = recurse_or_poisoned(policy, src, message, depth, visited, out);
            let stack = recurse_or_poisoned(policy, src, stack, depth, visited, out);
            visited.remove(&id.0);
            out.push(Node::Error { name, message, stack })
        }

        Node::Array(items) => {
            if !visited.insert(id.0) {
                return out.push_string(CIRCULAR_MARKER);
            }
            let items: Vec<NodeId> = items
                .iter()
                .map(|c| recurse_or_poisoned(policy, src, *c, depth, visited, out))
                .collect();
            visited.remove(&id.0);
            out.push(Node::Array(items))
        }

        Node::Map(pairs) => {
            if !visited.insert(id.0) {
                return out.push_string(CIRCULAR_MARKER);
            }
            let pairs: Vec<(NodeId, NodeId)> = pairs
                .iter()
                .map(|(k, v)| {
                    (
                        recurse_or_poisoned(policy, src, *k, depth, visited, out),
                        recurse_or_poisoned(policy, src, *v, depth, visited, out),
                    )
                })
                .collect();
            visited.remove(&id.0);
            out.push(Node::Map(pairs))
        }

        Node::Set(items) => {
            if !visited.insert(id.0) {
                return out.push_string(CIRCULAR_MARKER);
            }
            let mut rendered: Vec<String> = Vec::new();
            let mut deduped: Vec<NodeId> = Vec::new();
            for c in &items {
                let new_id = recurse_or_poisoned(policy, src, *c, depth, visited, out);
                let key = render(out, new_id);
                if !rendered.contains(&key) {
                    rendered.push(key);
                    deduped.push(new_id);
                }
            }
            visited.remove(&id.0);
            out.push(Node::Set(deduped))
        }

        Node::Object { type_tag, fields } => {
            if !visited.insert(id.0) {
                return out.push_string(CIRCULAR_MARKER);
            }
            let mut new_fields = Vec::with_capacity(fields.len() + 1);
            for (key, value_id) in &fields {
                let lowered = key.to_lowercase();
                let sensitive = policy.sensitive_field_names.iter().any(|s| lowered.contains(s.as_str()));
                let new_value = if matches!(src.get(*value_id), Node::Poisoned) {
                    out.push_string(ACCESSOR_ERROR_MARKER)
                } else if sensitive {
                    field_level_mask(src, *value_id, out)
                } else {
                    sanitize_node(policy, src, *value_id, depth + 1, visited, out)
                };
                new_fields.push((key.clone(), new_value));
            }
            visited.remove(&id.0);
            if let Some(tag) = &type_tag {
                let tag_id = out.push_string(tag.clone());
                new_fields.push(("__type".to_string(), tag_id));
            }
            out.push(Node::Object { type_tag, fields: new_fields })
        }
    }
}

/// Recurse one level deeper, turning a poisoned child directly into the
/// accessor-error marker without letting it abort sibling traversal.
fn recurse_or_poisoned(
    policy: &MaskingPolicy,
    src: &ValueArena,
    id: NodeId,
    depth: usize,
    visited: &mut HashSet<usize>,
    out: &mut ValueArena,
) -> NodeId {
    if matches!(src.get(id), Node::Poisoned) {
        return out.push_string(ACCESSOR_ERROR_MARKER);
    }
    sanitize_node(policy, src, id, depth + 1, visited, out)
}

fn render(arena: &ValueArena, id: NodeId) -> String {
    format!("{:?}", arena.to_json(id))
}

fn field_level_mask(src: &ValueArena, id: NodeId, out: &mut ValueArena) -> NodeId {
    match src.get(id) {
        Node::String(s) if s.chars().count() <= 3 => out.push_string("***"),
        Node::String(s) => {
            let mut chars = s.chars();
            let first = chars.next().unwrap_or_default();
            let last = s.chars().last().unwrap_or_default();
            out.push_string(format!("{first}***{last}"))
        }
        Node::Number(_) | Node::Bool(_) | Node::Null => out.push_string("***"),
        _ => out.push_string("***[MASKED]***"),
    }
}

fn sanitize_string(policy: &MaskingPolicy, input: &str) -> String {
    let mut current = input.to_string();
    for rule in policy.active_rules() {
        current = rule.apply(&current);
    }
    current
}

fn contains_pii_node(
    policy: &MaskingPolicy,
    src: &ValueArena,
    id: NodeId,
    depth: usize,
    visited: &mut HashSet<usize>,
) -> bool {
    if depth > policy.max_depth {
        return false;
    }
    match src.get(id) {
        Node::String(s) => policy.active_rules().any(|r| r.is_match(s)),
        Node::Error { message, stack, .. } => {
            if !visited.insert(id.0) {
                return false;
            }
            let hit = contains_pii_node(policy, src, *message, depth + 1, visited)
                || contains_pii_node(policy, src, *stack, depth + 1, visited);
            visited.remove(&id.0);
            hit
        }
        Node::Array(items) | Node::Set(items) => {
            if !visited.insert(id.0) {
                return false;
            }
            let hit = items.iter().any(|c| contains_pii_node(policy, src, *c, depth + 1, visited));
            visited.remove(&id.0);
            hit
        }
        Node::Map(pairs) => {
            if !visited.insert(id.0) {
                return false;
            }
            let hit = pairs.iter().any(|(k, v)| {
                contains_pii_node(policy, src, *k, depth + 1, visited)
                    || contains_pii_node(policy, src, *v, depth + 1, visited)
            });
            visited.remove(&id.0);
            hit
        }
        Node::Object { fields, .. } => {
            if !visited.insert(id.0) {
                return false;
            }
            let hit = fields.iter().any(|(key, value_id)| {
                let lowered = key.to_lowercase();
                policy.sensitive_field_names.iter().any(|s| lowered.contains(s.as_str()))
                    || contains_pii_node(policy, src, *value_id, depth + 1, visited)
            });
            visited.remove(&id.0);
            hit
        }
        _ => false,
    }
}

fn sanitize_email(email: &str) -> String {
    let Some((local, domain)) = email.split_once('@') else {
        return email.to_string();
    };
    let masked_local = mask_stem(local);
    let (stem, tld) = match domain.rsplit_once('.') {
        Some((stem, tld)) => (mask_stem(stem), tld),
        None => (mask_stem(domain), ""),
    };
    if tld.is_empty() {
        format!("{masked_local}@{stem}")
    } else {
        format!("{masked_local}@{stem}.{tld}")
    }
}

fn mask_stem(s: &str) -> String {
    let mut chars = s.chars();
    match (chars.next(), s.chars().last()) {
        (Some(first), Some(last)) if s.chars().count() > 2 => format!("{first}***{last}"),
        _ => "***".to_string(),
    }
}

fn sanitize_phone(phone: &str) -> String {
    let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
    if digits.len() >= 4 {
        format!("***-***-{}", &digits[digits.len() - 4..])
    } else {
        "***-***".to_string()
    }
}

fn sanitize_credit_card(card: &str) -> String {
    let digits: String = card.chars().filter(char::is_ascii_digit).collect();
    if digits.len() >= 4 {
        format!("****-****-****-{}", &digits[digits.len() - 4..])
    } else {
        "****".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn production_sanitizer() -> Sanitizer {
        Sanitizer::new(MaskingPolicy::new(Mode::Production).unwrap()).unwrap()
    }

    // S1 — email masking
    #[test]
    fn s1_email_masking() {
        let san = production_sanitizer();
        let input = json!({ "email": "john.doe@company.com" });
        let out = san.sanitize_json(&input);
        assert_ne!(out, input);
        assert_eq!(out["email"], json!("***@***.***"));
        assert_eq!(sanitize_email("john.doe@company.com"), "j***e@c***.com");
    }

    // S2 — nested cycle
    #[test]
    fn s2_nested_cycle() {
        let san = production_sanitizer();
        let mut arena = ValueArena::new();
        let name = arena.push_string("x");
        let email = arena.push_string("u@e.co");
        // Reserve the object's slot so we can point `self` back at it.
        let obj_id = arena.push(Node::Null);
        let self_field = obj_id; // the back-reference
        let fields = vec![
            ("name".to_string(), name),
            ("email".to_string(), email),
            ("self".to_string(), self_field),
        ];
        *arena.node_mut(obj_id) = Node::Object { type_tag: None, fields };

        let (out, root) = san.sanitize(&arena, obj_id);
        let json = out.to_json(root);
        assert_eq!(json["name"], json!("x"));
        assert_eq!(json["email"], json!("***@***.***"));
        assert_eq!(json["self"], json!("[CIRCULAR]"));
    }

    // S3 — deep object with a password at the truncation frontier
    #[test]
    fn s3_deep_object_truncates() {
        let san = production_sanitizer();
        let mut arena = ValueArena::new();
        let mut current = arena.push_string("the actual password value");
        for i in (0..60).rev() {
            let key = if i == 59 { "password".to_string() } else { format!("level{i}") };
            current = arena.push(Node::Object { type_tag: None, fields: vec![(key, current)] });
        }
        let (out, root) = san.sanitize(&arena, current);
        let rendered = format!("{:?}", out.to_json(root));
        assert!(rendered.contains("MAX_DEPTH_EXCEEDED"));
        assert!(!rendered.contains("the actual password value"));
    }

    #[test]
    fn dev_mode_is_identity() {
        let san = Sanitizer::new(MaskingPolicy::new(Mode::Development).unwrap()).unwrap();
        let input = json!({ "email": "a@b.com", "password": "hunter2" });
        assert_eq!(san.sanitize_json(&input), input);
    }

    #[test]
    fn disabled_policy_is_identity() {
        let mut policy = MaskingPolicy::new(Mode::Production).unwrap();
        policy.enabled = false;
        let san = Sanitizer::new(policy).unwrap();
        let input = json!({ "email": "a@b.com" });
        assert_eq!(san.sanitize_json(&input), input);
    }

    #[test]
    fn sensitive_field_name_masks_regardless_of_type() {
        let san = production_sanitizer();
        let input = json!({ "password": "hunter2", "count": 42, "ok": true, "nil": null });
        let out = san.sanitize_json(&input);
        assert_eq!(out["password"], json!("h***2"));
        assert_eq!(out["count"], json!("***"));
        assert_eq!(out["ok"], json!("***"));
        assert_eq!(out["nil"], json!("***"));
    }

    #[test]
    fn short_sensitive_string_masks_fully() {
        let san = production_sanitizer();
        let input = json!({ "pin": "12" });
        assert_eq!(san.sanitize_json(&input)["pin"], json!("***"));
    }

    #[test]
    fn contains_pii_detects_rule_match_and_sensitive_field() {
        let san = production_sanitizer();
        assert!(san.contains_pii_json(&json!({ "note": "contact a@b.com" })));
        assert!(san.contains_pii_json(&json!({ "password": "irrelevant-type" })));
        assert!(!san.contains_pii_json(&json!({ "note": "nothing interesting here" })));
    }

    #[test]
    fn accessor_error_is_contained_to_one_key() {
        let mut arena = ValueArena::new();
        let ok_value = arena.push_string("fine");
        let poisoned = arena.push(Node::Poisoned);
        let obj = arena.push(Node::Object {
            type_tag: None,
            fields: vec![("ok".to_string(), ok_value), ("bad".to_string(), poisoned)],
        });
        let san = production_sanitizer();
        let (out, root) = san.sanitize(&arena, obj);
        let json = out.to_json(root);
        assert_eq!(json["ok"], json!("fine"));
        assert_eq!(json["bad"], json!("[Error accessing property]"));
    }

    #[test]
    fn class_instance_gets_type_tag() {
        let mut arena = ValueArena::new();
        let v = arena.push_string("x");
        let obj = arena.push(Node::Object { type_tag: Some("CustomError".into()), fields: vec![("msg".into(), v)] });
        let san = production_sanitizer();
        let (out, root) = san.sanitize(&arena, obj);
        assert_eq!(out.to_json(root)["__type"], json!("CustomError"));
    }

    #[test]
    fn sanitize_field_helpers_work_without_whole_object_sanitization() {
        assert_eq!(sanitize_phone("555-123-4567"), "***-***-4567");
        assert_eq!(sanitize_phone("12"), "***-***");
        assert_eq!(sanitize_credit_card("4111 1111 1111 1111"), "****-****-****-1111");
        assert_eq!(sanitize_credit_card("12"), "****");
    }

    #[test]
    fn canonical_token_dispatch_for_non_plain_shapes() {
        let san = production_sanitizer();
        let mut arena = ValueArena::new();
        let func = arena.push(Node::Function);
        let date = arena.push(Node::Date("2024-01-01T00:00:00Z".into()));
        let bytes = arena.push(Node::Bytes(vec![1, 2, 3]));
        let promise = arena.push(Node::Promise);
        let weak = arena.push(Node::WeakCollection("WeakMap"));
        let arr = arena.push(Node::Array(vec![func, date, bytes, promise, weak]));

        let (out, root) = san.sanitize(&arena, arr);
        let json = out.to_json(root);
        assert_eq!(json[0], json!("[Function]"));
        assert_eq!(json[1], json!("2024-01-01T00:00:00Z"));
        assert_eq!(json[2], json!("[Binary Data]"));
        assert_eq!(json[3], json!("[Promise]"));
        assert_eq!(json[4], json!("[WeakMap]"));
    }

    #[test]
    fn error_value_recurses_into_message_and_stack() {
        let san = production_sanitizer();
        let mut arena = ValueArena::new();
        let message = arena.push_string("failed for a@b.com");
        let stack = arena.push_string("at handler (a@b.com:1:1)");
        let err = arena.push(Node::Error { name: "Error".into(), message, stack });

        let (out, root) = san.sanitize(&arena, err);
        let json = out.to_json(root);
        assert_eq!(json["name"], json!("Error"));
        assert!(json["message"].as_str().unwrap().contains("***@***.***"));
        assert!(json["stack"].as_str().unwrap().contains("***@***.***"));
    }

    #[test]
    fn set_collapses_duplicates_after_sanitizing() {
        let san = production_sanitizer();
        let mut arena = ValueArena::new();
        let a = arena.push_string("a@b.com");
        let b = arena.push_string("c@b.com");
        let set = arena.push(Node::Set(vec![a, b]));

        let (out, root) = san.sanitize(&arena, set);
        match out.get(root) {
            Node::Set(items) => assert_eq!(items.len(), 1),
            other => panic!("expected a Set, got {other:?}"),
        }
    }

    #[test]
    fn map_recurses_into_both_keys_and_values() {
        let san = production_sanitizer();
        let mut arena = ValueArena::new();
        let key = arena.push_string("a@b.com");
        let value = arena.push_string("password is hunter2");
        let map = arena.push(Node::Map(vec![(key, value)]));

        let (out, root) = san.sanitize(&arena, map);
        let json = out.to_json(root);
        let pair = &json[0];
        assert_eq!(pair[0], json!("***@***.***"));
        assert_eq!(pair[1], json!("[REDACTED] is hunter2"));
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::collection::{hash_map, vec as pvec};
    use proptest::prelude::*;

    fn arb_json() -> impl Strategy<Value = serde_json::Value> {
        let leaf = prop_oneof![
            Just(serde_json::Value::Null),
            any::<bool>().prop_map(serde_json::Value::from),
            any::<i32>().prop_map(serde_json::Value::from),
            "[a-zA-Z0-9@. _-]{0,24}".prop_map(serde_json::Value::from),
        ];
        leaf.prop_recursive(4, 64, 8, |inner| {
            prop_oneof![
                pvec(inner.clone(), 0..4).prop_map(serde_json::Value::from),
                hash_map("[a-zA-Z_]{1,10}", inner, 0..4)
                    .prop_map(|m| serde_json::Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        // Property 1: idempotence
        #[test]
        fn sanitize_is_idempotent(v in arb_json()) {
            let san = Sanitizer::new(MaskingPolicy::new(Mode::Production).unwrap()).unwrap();
            let once = san.sanitize_json(&v);
            let twice = san.sanitize_json(&once);
            prop_assert_eq!(once, twice);
        }

        // Property 2: dev-mode identity
        #[test]
        fn dev_mode_is_always_identity(v in arb_json()) {
            let san = Sanitizer::new(MaskingPolicy::new(Mode::Development).unwrap()).unwrap();
            prop_assert_eq!(san.sanitize_json(&v), v);
        }

        // Property 5: containment monotonicity (no PII anywhere -> identity,
        // modulo the absent __type tag which JSON input never carries)
        #[test]
        fn no_pii_means_identity(v in arb_json()) {
            let san = Sanitizer::new(MaskingPolicy::new(Mode::Production).unwrap()).unwrap();
            if !san.contains_pii_json(&v) {
                prop_assert_eq!(san.sanitize_json(&v), v);
            }
        }
    }

    // Property 3: cycle termination
    #[test]
    fn cycle_terminates() {
        let mut arena = ValueArena::new();
        let obj = arena.push(Node::Null);
        *arena.node_mut(obj) =
            Node::Object { type_tag: None, fields: vec![("self".to_string(), obj)] };
        let san = Sanitizer::new(MaskingPolicy::new(Mode::Production).unwrap()).unwrap();
        let (out, root) = san.sanitize(&arena, obj);
        assert!(out.len() < 10);
        let _ = out.to_json(root); // must not recurse forever
    }

    // Property 4: depth termination
    #[test]
    fn depth_terminates_and_is_bounded() {
        let mut arena = ValueArena::new();
        let mut current = arena.push_string("leaf");
        for i in 0..200 {
            current = arena.push(Node::Object { type_tag: None, fields: vec![(format!("l{i}"), current)] });
        }
        let mut policy = MaskingPolicy::new(Mode::Production).unwrap();
        policy.max_depth = 10;
        let san = Sanitizer::new(policy).unwrap();
        let (out, root) = san.sanitize(&arena, current);
        let rendered = format!("{:?}", out.to_json(root));
        assert!(rendered.contains("MAX_DEPTH_EXCEEDED"));
    }
}
