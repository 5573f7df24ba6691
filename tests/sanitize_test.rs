//! Sanitizer tests over generated result graphs.

use pooled_db::db::DynamicRow;
use pooled_db::sanitize::{SanitizeMode, Sanitizer, sanitize, sanitize_concurrent};
use rand::Rng;
use rand::seq::SliceRandom;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const PADDING: &[&str] = &["", " ", "  ", "\t", "\n", " \r\n", "\u{a0}", "\u{3000}"];

fn padded(rng: &mut impl Rng, core: &str) -> String {
    let left = PADDING.choose(rng).unwrap();
    let right = PADDING.choose(rng).unwrap();
    format!("{}{}{}", left, core, right)
}

pooled_db::traversable_record! {
    #[derive(Debug, Clone, PartialEq)]
    pub struct Order {
        pub id: i64,
        pub customer: String,
        pub lines: Vec<OrderLine>,
        pub notes: HashMap<String, Option<String>>,
        #[member(computed)]
        pub summary: String,
    }
}

pooled_db::traversable_record! {
    #[derive(Debug, Clone, PartialEq)]
    pub struct OrderLine {
        pub sku: String,
        pub quantity: u32,
        pub attributes: serde_json::Value,
    }
}

fn random_orders(count: usize) -> Vec<Order> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|i| {
            let lines = (0..rng.gen_range(0..6))
                .map(|j| OrderLine {
                    sku: padded(&mut rng, &format!("SKU-{}-{}", i, j)),
                    quantity: rng.gen_range(1..100),
                    attributes: json!({
                        "color": padded(&mut rng, "red"),
                        "sizes": [padded(&mut rng, "S"), padded(&mut rng, "M")],
                        "weight": rng.gen_range(0.0..10.0),
                    }),
                })
                .collect();
            let mut notes = HashMap::new();
            notes.insert("gift".to_string(), Some(padded(&mut rng, "yes")));
            notes.insert("memo".to_string(), None);
            Order {
                id: i as i64,
                customer: padded(&mut rng, &format!("customer {}", i)),
                lines,
                notes,
                summary: format!("  order {}  ", i),
            }
        })
        .collect()
}

fn assert_clean(order: &Order) {
    assert_eq!(order.customer, order.customer.trim());
    assert_eq!(order.summary, format!("  order {}  ", order.id));
    for line in &order.lines {
        assert_eq!(line.sku, line.sku.trim());
        assert!(line.sku.starts_with("SKU-"));
        assert_eq!(line.attributes["color"], json!("red"));
        assert_eq!(line.attributes["sizes"], json!(["S", "M"]));
        assert!(line.attributes["weight"].is_f64());
    }
    assert_eq!(
        order.notes.get("gift").cloned().flatten().as_deref(),
        Some("yes")
    );
    assert_eq!(order.notes.get("memo"), Some(&None));
}

#[test]
fn test_generated_records_are_trimmed() {
    let mut orders = random_orders(200);
    let stats = sanitize(&mut orders);
    orders.iter().for_each(assert_clean);
    assert_eq!(stats.skipped, 200);
}

#[test]
fn test_concurrent_and_sequential_agree() {
    let orders = random_orders(300);
    let mut sequential = orders.clone();
    let mut concurrent = orders;

    let seq = sanitize(&mut sequential);
    let par = Sanitizer::new(SanitizeMode::Concurrent)
        .with_parallel_threshold(4)
        .run(&mut concurrent);

    assert_eq!(sequential, concurrent);
    assert_eq!(seq, par);
}

#[test]
fn test_second_pass_changes_nothing() {
    let mut orders = random_orders(50);
    sanitize_concurrent(&mut orders);
    let snapshot = orders.clone();

    let stats = sanitize(&mut orders);
    assert_eq!(orders, snapshot);
    assert_eq!(stats.trimmed, 0);
}

#[test]
fn test_shared_node_visited_once() {
    let shared = Arc::new(Mutex::new(DynamicRow::new().with("name", "  shared  ")));
    let mut rows: Vec<Arc<Mutex<DynamicRow>>> = (0..10).map(|_| Arc::clone(&shared)).collect();

    let stats = sanitize(&mut rows);

    assert_eq!(stats.trimmed, 1);
    assert_eq!(stats.revisited, 9);
    assert_eq!(
        shared.lock().unwrap().get("name"),
        Some(&json!("shared"))
    );
}

#[test]
fn test_shared_node_visited_once_concurrently() {
    let shared = Arc::new(Mutex::new(vec![" a ".to_string(), " b ".to_string()]));
    let mut graph: Vec<Arc<Mutex<Vec<String>>>> = (0..256).map(|_| Arc::clone(&shared)).collect();

    let stats = Sanitizer::new(SanitizeMode::Concurrent)
        .with_parallel_threshold(2)
        .run(&mut graph);

    assert_eq!(stats.trimmed, 2);
    assert_eq!(stats.revisited, 255);
    assert_eq!(*shared.lock().unwrap(), vec!["a", "b"]);
}

#[test]
fn test_wide_dynamic_rows() {
    let mut rng = rand::thread_rng();
    let mut rows: Vec<DynamicRow> = (0..1000)
        .map(|i| {
            DynamicRow::new()
                .with("Id", i)
                .with("Code", padded(&mut rng, "X1"))
                .with("Amount", rng.gen_range(0.0..1000.0))
                .with("Flag", rng.gen_bool(0.5))
        })
        .collect();
    let before: Vec<_> = rows
        .iter()
        .map(|r| (r.get("Id").cloned(), r.get("Amount").cloned(), r.get("Flag").cloned()))
        .collect();

    sanitize_concurrent(&mut rows);

    for (row, (id, amount, flag)) in rows.iter().zip(before) {
        assert_eq!(row.get("Code"), Some(&json!("X1")));
        assert_eq!(row.get("Id").cloned(), id);
        assert_eq!(row.get("Amount").cloned(), amount);
        assert_eq!(row.get("Flag").cloned(), flag);
    }
}
