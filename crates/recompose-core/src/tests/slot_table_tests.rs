use super::*;
use crate::arena::GenerationalArena;
use crate::changes::{Change, Node};
use std::cell::RefCell;

const ITEM: Key = 0x17e;
const CONTAINER: Key = 0xc0;

struct Leaf;

impl Node for Leaf {}

struct Probe {
    name: &'static str,
    events: Rc<RefCell<Vec<String>>>,
}

impl RememberObserver for Probe {
    fn on_forgotten(&self) {
        self.events.borrow_mut().push(format!("forgot {}", self.name));
    }
}

fn probe(name: &'static str, events: &Rc<RefCell<Vec<String>>>) -> SlotValue {
    let observer: Rc<dyn RememberObserver> = Rc::new(Probe {
        name,
        events: Rc::clone(events),
    });
    SlotValue::Object(RememberedObject::with_observer(name, observer))
}

/// A keyed node group holding one remembered label. Returns the label that
/// ends up stored, which is the first one ever written for this identity.
fn item(
    table: &mut SlotTable,
    log: &mut EditLog,
    object_key: ObjectKey,
    id: NodeId,
    label: &'static str,
) -> &'static str {
    table.begin_group(ITEM, Some(object_key), GroupFlags::NODE, log);
    if table.use_node(log).is_none() {
        let index = table.node_index();
        log.changes.insert(index, id, Box::new(Leaf));
        table.record_node(id, log);
    }
    let stored = match table.peek() {
        Some(SlotValue::Object(object)) => object.downcast_ref::<&'static str>().copied(),
        _ => None,
    };
    let stored = match stored {
        Some(stored) => {
            table.skip_slot();
            stored
        }
        None => {
            table.write_slot(SlotValue::Object(RememberedObject::new(label)), log);
            label
        }
    };
    table.end_group(log);
    stored
}

fn describe(log: &mut EditLog) -> Vec<String> {
    log.changes
        .take()
        .iter()
        .map(|change| format!("{change:?}"))
        .collect()
}

fn items(table: &mut SlotTable, order: &[(ObjectKey, NodeId)]) -> (Vec<&'static str>, EditLog) {
    let mut log = EditLog::default();
    table.begin_pass();
    let labels = order
        .iter()
        .map(|&(key, id)| item(table, &mut log, key, id, "replacement"))
        .collect();
    table.end_pass(&mut log);
    (labels, log)
}

fn seed(table: &mut SlotTable, entries: &[(ObjectKey, NodeId, &'static str)]) {
    let mut log = EditLog::default();
    table.begin_pass();
    for &(key, id, label) in entries {
        item(table, &mut log, key, id, label);
    }
    table.end_pass(&mut log);
}

#[test]
fn second_pass_reuses_everything() {
    let mut table = SlotTable::new();
    let mut log = EditLog::default();
    table.begin_pass();
    let first = table.begin_group(CONTAINER, None, GroupFlags::PLAIN, &mut log);
    assert!(!first.reused);
    table.write_slot(SlotValue::Primitive(7.into()), &mut log);
    table.end_group(&mut log);
    table.end_pass(&mut log);
    assert_eq!(table.len(), 2);

    table.begin_pass();
    let again = table.begin_group(CONTAINER, None, GroupFlags::PLAIN, &mut log);
    assert!(again.reused);
    assert!(matches!(table.peek(), Some(SlotValue::Primitive(Primitive::Int(7)))));
    table.skip_slot();
    table.end_group(&mut log);
    table.end_pass(&mut log);

    assert!(log.is_empty());
    assert_eq!(table.len(), 2);
    assert_eq!(table.verify(), Ok(()));
}

#[test]
fn reorder_emits_a_single_move_and_keeps_state() {
    let mut table = SlotTable::new();
    seed(&mut table, &[(1, 10, "a"), (2, 11, "b"), (3, 12, "c")]);

    let (labels, mut log) = items(&mut table, &[(3, 12), (1, 10), (2, 11)]);

    assert_eq!(labels, vec!["c", "a", "b"]);
    assert_eq!(describe(&mut log), vec!["Move { from: 2, to: 0, count: 1 }"]);
    assert!(log.remember.is_empty());
    assert_eq!(table.verify(), Ok(()));
}

#[test]
fn removed_sibling_is_trimmed_after_moves() {
    let mut table = SlotTable::new();
    seed(&mut table, &[(1, 10, "a"), (2, 11, "b"), (3, 12, "c")]);
    let moved = table.anchor(6).expect("third item");
    let dropped = table.anchor(3).expect("second item");

    let (labels, mut log) = items(&mut table, &[(1, 10), (3, 12)]);

    assert_eq!(labels, vec!["a", "c"]);
    assert_eq!(
        describe(&mut log),
        vec![
            "Move { from: 2, to: 1, count: 1 }",
            "Remove { index: 2, count: 1 }"
        ]
    );
    assert_eq!(table.resolve(&moved), Some(3));
    assert_eq!(table.resolve(&dropped), None);
    assert!(!dropped.is_valid());
}

#[test]
fn new_items_are_inserted_at_their_node_index() {
    let mut table = SlotTable::new();
    let mut log = EditLog::default();
    table.begin_pass();
    table.begin_group(CONTAINER, None, GroupFlags::PLAIN, &mut log);
    item(&mut table, &mut log, 1, 10, "a");
    item(&mut table, &mut log, 2, 11, "b");
    table.end_group(&mut log);
    table.end_pass(&mut log);
    log.changes.take();

    table.begin_pass();
    table.skip_group();
    assert_eq!(table.node_index(), 2, "skipping counts the group's nodes");
    item(&mut table, &mut log, 3, 12, "c");
    table.end_pass(&mut log);

    assert_eq!(describe(&mut log), vec!["Insert { index: 2, id: 12 }"]);
    assert_eq!(table.verify(), Ok(()));
}

#[test]
fn skip_to_group_end_keeps_content() {
    let mut table = SlotTable::new();
    let mut log = EditLog::default();
    table.begin_pass();
    table.begin_group(CONTAINER, None, GroupFlags::PLAIN, &mut log);
    item(&mut table, &mut log, 1, 10, "a");
    table.end_group(&mut log);
    item(&mut table, &mut log, 2, 11, "b");
    table.end_pass(&mut log);
    log.changes.take();

    table.begin_pass();
    table.begin_group(CONTAINER, None, GroupFlags::PLAIN, &mut log);
    table.skip_to_group_end();
    table.end_group(&mut log);
    assert_eq!(table.node_index(), 1);
    item(&mut table, &mut log, 2, 11, "b");
    table.end_pass(&mut log);

    assert!(log.changes.is_empty());
    assert_eq!(table.len(), 7);
}

#[test]
fn forgetting_runs_innermost_first() {
    let events: Rc<RefCell<Vec<String>>> = Rc::default();
    let mut table = SlotTable::new();
    let mut log = EditLog::default();
    table.begin_pass();
    table.begin_group(CONTAINER, None, GroupFlags::PLAIN, &mut log);
    table.write_slot(probe("outer-a", &events), &mut log);
    table.begin_group(ITEM, None, GroupFlags::PLAIN, &mut log);
    table.write_slot(probe("inner", &events), &mut log);
    table.end_group(&mut log);
    table.write_slot(probe("outer-b", &events), &mut log);
    table.end_group(&mut log);
    table.begin_group(ITEM + 1, None, GroupFlags::PLAIN, &mut log);
    table.write_slot(probe("later", &events), &mut log);
    table.end_group(&mut log);
    table.end_pass(&mut log);

    table.begin_pass();
    table.end_pass(&mut log);
    std::mem::take(&mut log.remember).dispatch();

    assert_eq!(
        *events.borrow(),
        vec!["forgot later", "forgot inner", "forgot outer-b", "forgot outer-a"]
    );
    assert!(table.is_empty());
}

#[test]
fn duplicate_keys_are_diagnosed_not_fatal() {
    let mut table = SlotTable::new();
    seed(&mut table, &[(5, 10, "first"), (5, 11, "second")]);

    let (labels, log) = items(&mut table, &[(5, 10), (5, 11)]);

    assert_eq!(labels, vec!["first", "second"]);
    assert_eq!(
        log.diagnostics,
        vec![Diagnostic::DuplicateKey {
            key: ITEM,
            object_key: Some(5)
        }]
    );
}

#[test]
fn released_scopes_are_reported_on_removal() {
    let mut scopes: GenerationalArena<()> = GenerationalArena::new();
    let scope = scopes.insert(());
    let mut table = SlotTable::new();
    let mut log = EditLog::default();
    table.begin_pass();
    let start = table.begin_group(CONTAINER, None, GroupFlags::RESTARTABLE, &mut log);
    table.set_group_scope(start.index, scope);
    table.end_group(&mut log);
    table.end_pass(&mut log);

    table.begin_pass();
    let again = table.begin_group(CONTAINER, None, GroupFlags::RESTARTABLE, &mut log);
    assert_eq!(again.scope, Some(scope));
    table.end_group(&mut log);
    table.end_pass(&mut log);
    assert!(log.released_scopes.is_empty());

    table.begin_pass();
    table.end_pass(&mut log);
    assert_eq!(log.released_scopes, vec![scope]);
}

#[test]
fn checkpoint_rejects_structural_drift() {
    let mut table = SlotTable::new();
    let mut log = EditLog::default();
    table.begin_pass();
    table.begin_group(CONTAINER, None, GroupFlags::PLAIN, &mut log);
    let token = table.checkpoint();
    assert_eq!(token.depth(), 2);
    table.write_slot(SlotValue::Primitive(1.into()), &mut log);
    assert!(table.resume(&token).is_err(), "a slot was inserted since");
    table.end_group(&mut log);
    table.end_pass(&mut log);

    table.begin_pass();
    table.begin_group(CONTAINER, None, GroupFlags::PLAIN, &mut log);
    let token = table.checkpoint();
    table.skip_slot();
    assert_eq!(table.resume(&token), Ok(()));
    assert!(matches!(table.peek(), Some(SlotValue::Primitive(_))));
    table.skip_slot();
    table.end_group(&mut log);
    assert!(table.resume(&token).is_err(), "the group closed");
    table.end_pass(&mut log);
}

#[test]
fn abort_leaves_a_well_formed_table() {
    let mut table = SlotTable::new();
    let mut log = EditLog::default();
    table.begin_pass();
    table.begin_group(CONTAINER, None, GroupFlags::PLAIN, &mut log);
    table.begin_group(ITEM, None, GroupFlags::PLAIN, &mut log);
    table.write_slot(SlotValue::Empty, &mut log);
    table.abort_frames(&mut log);

    assert!(!table.in_pass());
    assert_eq!(table.len(), 3);
    assert_eq!(table.verify(), Ok(()));
    assert_eq!(table.group(0).map(|header| header.size), Some(3));
}

#[test]
fn discarding_content_switches_to_insert() {
    let events: Rc<RefCell<Vec<String>>> = Rc::default();
    let mut table = SlotTable::new();
    let mut log = EditLog::default();
    table.begin_pass();
    table.begin_group(CONTAINER, None, GroupFlags::RESTARTABLE, &mut log);
    table.write_slot(probe("cell", &events), &mut log);
    table.end_group(&mut log);
    table.end_pass(&mut log);

    table.begin_pass();
    table.begin_group(CONTAINER, None, GroupFlags::RESTARTABLE, &mut log);
    table.discard_group_content(&mut log);
    assert!(table.is_inserting());
    assert!(table.peek().is_none());
    table.write_slot(SlotValue::Primitive("fresh".into()), &mut log);
    table.end_group(&mut log);
    table.end_pass(&mut log);

    std::mem::take(&mut log.remember).dispatch();
    assert_eq!(*events.borrow(), vec!["forgot cell"]);
    assert_eq!(table.verify(), Ok(()));
}

#[test]
fn dispose_clears_and_forgets() {
    let events: Rc<RefCell<Vec<String>>> = Rc::default();
    let mut table = SlotTable::new();
    let mut log = EditLog::default();
    table.begin_pass();
    table.begin_group(CONTAINER, None, GroupFlags::PLAIN, &mut log);
    table.write_slot(probe("held", &events), &mut log);
    table.end_group(&mut log);
    table.end_pass(&mut log);

    table.dispose(&mut log);
    std::mem::take(&mut log.remember).dispatch();

    assert!(table.is_empty());
    assert!(matches!(log.changes.take().last(), Some(Change::Clear)));
    assert_eq!(*events.borrow(), vec!["forgot held"]);
}

#[test]
fn dump_indents_nested_groups() {
    let mut table = SlotTable::new();
    seed(&mut table, &[(1, 10, "a")]);
    let dump = table.dump();
    let lines: Vec<&str> = dump.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].contains("Group(key=0x17e, object_key=Some(1), size=3, nodes=1)"));
    assert!(lines[1].ends_with("  Node(10)"));
    assert!(lines[2].ends_with("  Object"));
}

#[test]
fn float_primitives_compare_by_bits() {
    assert_eq!(Primitive::from(f64::NAN), Primitive::from(f64::NAN));
    assert_ne!(Primitive::from(0.0), Primitive::from(-0.0));
    assert_ne!(Primitive::from(1i64), Primitive::from(1u64));
}

#[test]
#[should_panic(expected = "end_group with no open group")]
fn end_group_outside_a_pass_panics() {
    let mut table = SlotTable::new();
    table.end_group(&mut EditLog::default());
}
