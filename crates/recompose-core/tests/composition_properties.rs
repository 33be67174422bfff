//! End-to-end behavior of `#[composable]` functions driven by the test rule.

use recompose_core::{
    mutable_state_of, remember, run_in_mutable_snapshot, with_current_composer, ComposeError,
    MutableState, RememberObserver,
};
use recompose_macros::composable;
use recompose_testing::{container, leaf, AppliedOp, ComposeTestRule};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

type Log = Rc<RefCell<Vec<String>>>;

fn take(log: &Log) -> Vec<String> {
    std::mem::take(&mut *log.borrow_mut())
}

#[derive(Clone, PartialEq)]
struct Item {
    id: u32,
    label: MutableState<String>,
}

fn items(labels: &[(u32, &str)]) -> Vec<Item> {
    labels
        .iter()
        .map(|(id, label)| Item {
            id: *id,
            label: mutable_state_of((*label).to_owned()),
        })
        .collect()
}

#[composable]
fn item_row(item: Item, log: Log) {
    log.borrow_mut().push(format!("row {}", item.id));
    let created = remember(|| item.id);
    leaf("row", &format!("{}:{}", created.get(), item.label.get()));
}

#[composable]
fn item_list(list: MutableState<Vec<Item>>, log: Log) {
    for item in list.get() {
        let log = Rc::clone(&log);
        with_current_composer(|composer| {
            composer.key(&item.id, |_| item_row(item.clone(), log));
        });
    }
}

fn list_rule(initial: Vec<Item>) -> (ComposeTestRule, MutableState<Vec<Item>>, Log) {
    let rule = ComposeTestRule::new();
    let list = mutable_state_of(initial);
    let log = Log::default();
    {
        let list = list.clone();
        let log = Rc::clone(&log);
        rule.set_content(move || item_list(list.clone(), Rc::clone(&log)))
            .expect("initial composition");
    }
    rule.take_ops();
    (rule, list, log)
}

#[test]
fn mutating_one_item_recomposes_only_that_item() {
    let initial = items(&[(1, "a"), (2, "b"), (3, "c")]);
    let second = initial[1].label.clone();
    let (rule, _list, log) = list_rule(initial);
    assert_eq!(take(&log), vec!["row 1", "row 2", "row 3"]);

    second.set(String::from("B"));
    rule.pump_until_idle().expect("frames");

    assert_eq!(take(&log), vec!["row 2"]);
    assert_eq!(rule.take_ops(), vec![AppliedOp::Update(2)]);
    assert_eq!(rule.texts(), vec!["1:a", "2:B", "3:c"]);
}

#[test]
fn reordering_keyed_items_moves_nodes_and_keeps_state() {
    let initial = items(&[(1, "a"), (2, "b"), (3, "c")]);
    let (rule, list, log) = list_rule(initial.clone());
    take(&log);

    list.set(vec![initial[2].clone(), initial[0].clone(), initial[1].clone()]);
    rule.pump_until_idle().expect("frames");

    let ops = rule.take_ops();
    assert!(!ops.is_empty());
    assert!(
        ops.iter().all(|op| matches!(op, AppliedOp::Move { .. })),
        "reorder emitted more than moves: {ops:?}"
    );
    assert!(take(&log).is_empty(), "no row body re-ran");
    assert_eq!(rule.texts(), vec!["3:c", "1:a", "2:b"]);
}

#[test]
fn removing_and_inserting_items_matches_a_fresh_composition() {
    let initial = items(&[(1, "a"), (2, "b"), (3, "c"), (4, "d")]);
    let (rule, list, _log) = list_rule(initial.clone());

    let inserted = items(&[(9, "z")]).remove(0);
    list.set(vec![
        initial[3].clone(),
        inserted.clone(),
        initial[0].clone(),
        initial[2].clone(),
    ]);
    rule.pump_until_idle().expect("frames");
    initial[0].label.set(String::from("A"));
    rule.pump_until_idle().expect("frames");

    let final_items = vec![
        initial[3].clone(),
        inserted,
        initial[0].clone(),
        initial[2].clone(),
    ];
    let (fresh, _, _) = list_rule(final_items);
    assert_eq!(rule.texts(), fresh.texts());
    assert_eq!(rule.texts(), vec!["4:d", "9:z", "1:A", "3:c"]);
}

#[test]
fn identical_pass_emits_nothing() {
    let rule = ComposeTestRule::new();
    let content = || {
        container("box", || {
            leaf("a", "1");
            leaf("b", "2");
        });
    };
    rule.set_content(content).expect("first");
    assert!(!rule.take_ops().is_empty());

    rule.set_content(content).expect("second");
    assert!(rule.take_ops().is_empty());
}

struct Tracked {
    name: &'static str,
    log: Log,
}

impl RememberObserver for Tracked {
    fn on_remembered(&self) {
        self.log.borrow_mut().push(format!("+{}", self.name));
    }

    fn on_forgotten(&self) {
        self.log.borrow_mut().push(format!("-{}", self.name));
    }
}

fn track(name: &'static str, log: &Log) {
    let log = Rc::clone(log);
    with_current_composer(|composer| {
        composer.remember_observer(move || Tracked { name, log });
    });
}

#[composable]
fn leaf_holder(log: Log) {
    track("leaf", &log);
}

#[composable]
fn branch(log: Log) {
    track("branch-first", &log);
    leaf_holder(Rc::clone(&log));
    track("branch-last", &log);
}

#[test]
fn removal_forgets_nested_groups_first_exactly_once() {
    let rule = ComposeTestRule::new();
    let show = mutable_state_of(true);
    let log = Log::default();
    {
        let show = show.clone();
        let log = Rc::clone(&log);
        rule.set_content(move || {
            if show.get() {
                branch(Rc::clone(&log));
            }
        })
        .expect("compose");
    }
    assert_eq!(take(&log), vec!["+branch-first", "+leaf", "+branch-last"]);

    show.set(false);
    rule.pump_until_idle().expect("frames");
    assert_eq!(take(&log), vec!["-leaf", "-branch-last", "-branch-first"]);

    rule.dispose().expect("dispose");
    assert!(take(&log).is_empty());
}

#[composable]
fn fragile(fail: MutableState<bool>) {
    leaf("fragile", "start");
    if fail.get() {
        panic!("fragile failed");
    }
    leaf("fragile", "end");
}

#[test]
fn panicking_composable_recovers_once_fixed() {
    let rule = ComposeTestRule::new();
    let fail = mutable_state_of(true);
    let result = {
        let fail = fail.clone();
        rule.set_content(move || fragile(fail.clone()))
    };
    assert!(matches!(result, Err(ComposeError::ComposablePanicked { .. })));
    assert_eq!(rule.texts(), vec!["start"]);

    fail.set(false);
    rule.pump_until_idle().expect("recovered");
    assert_eq!(rule.texts(), vec!["start", "end"]);
}

#[test]
fn snapshot_writes_are_seen_together() {
    let rule = ComposeTestRule::new();
    let first = mutable_state_of(0);
    let second = mutable_state_of(0);
    let seen = Rc::new(RefCell::new(Vec::new()));
    {
        let first = first.clone();
        let second = second.clone();
        let seen = Rc::clone(&seen);
        rule.set_content(move || {
            seen.borrow_mut().push((first.get(), second.get()));
        })
        .expect("compose");
    }

    run_in_mutable_snapshot(|| {
        first.set(1);
        second.set(1);
    })
    .expect("apply");
    rule.pump_until_idle().expect("frames");

    assert_eq!(*seen.borrow(), vec![(0, 0), (1, 1)]);
}

#[test]
fn effects_follow_their_keys() {
    let rule = ComposeTestRule::new();
    let key = mutable_state_of(1);
    let log = Log::default();
    let ticks = Rc::new(Cell::new(0));
    {
        let key = key.clone();
        let log = Rc::clone(&log);
        let ticks = Rc::clone(&ticks);
        rule.set_content(move || {
            let current = key.get();
            let log = Rc::clone(&log);
            recompose_core::disposable_effect(&current, move |scope| {
                log.borrow_mut().push(format!("start {current}"));
                scope.on_dispose(move || log.borrow_mut().push(format!("stop {current}")))
            });
            let ticks = Rc::clone(&ticks);
            recompose_core::launched_effect(&(), move |scope| async move {
                let clock = scope.frame_clock();
                loop {
                    clock.next_frame().await;
                    ticks.set(ticks.get() + 1);
                }
            });
        })
        .expect("compose");
    }
    assert_eq!(take(&log), vec!["start 1"]);

    rule.advance_frame(16_000_000).expect("frame");
    rule.advance_frame(32_000_000).expect("frame");
    assert_eq!(ticks.get(), 1);

    key.set(2);
    rule.advance_frame(48_000_000).expect("frame");
    assert_eq!(take(&log), vec!["stop 1", "start 2"]);
    assert_eq!(ticks.get(), 2, "the launched effect kept running");

    rule.dispose().expect("dispose");
    assert_eq!(take(&log), vec!["stop 2"]);
}
