use super::*;
use crate::changes::Diagnostic;
use crate::composition::Composition;
use crate::local::composition_local_of;
use crate::platform::NoopScheduler;
use crate::state::mutable_state_of;
use crate::test_support::{take, text, Events, Probe, Recording, Text};
use std::cell::Cell;

const CHILD: Key = 0xc11d;

fn setup() -> (Composition<Recording>, Events) {
    let context = SchedulerContext::new(Arc::new(NoopScheduler));
    let ops = Events::default();
    (Composition::new(Recording::new(&ops), &context), ops)
}

#[test]
fn remember_computes_once_per_insert() {
    let (composition, _) = setup();
    let calls = Rc::new(Cell::new(0));
    let content = {
        let calls = Rc::clone(&calls);
        move |composer: &Composer| {
            let value = composer.remember(|| {
                calls.set(calls.get() + 1);
                String::from("kept")
            });
            assert_eq!(value.get(), "kept");
        }
    };

    composition.set_content_with(content.clone()).expect("first pass");
    composition.set_content_with(content).expect("second pass");

    assert_eq!(calls.get(), 1);
}

#[test]
fn identical_pass_emits_nothing() {
    let (composition, ops) = setup();
    let content = |composer: &Composer| {
        text(composer, "a");
        text(composer, "b");
    };

    composition.set_content_with(content).expect("first pass");
    assert_eq!(
        take(&ops),
        vec!["insert 1 at 0", "update 1", "insert 2 at 1", "update 2"]
    );

    composition.set_content_with(content).expect("second pass");
    assert!(take(&ops).is_empty());
    assert_eq!(composition.with_applier(|applier| applier.texts()), vec!["a", "b"]);
}

#[test]
fn changed_tracks_the_previous_value() {
    let (composition, _) = setup();
    let input = Rc::new(Cell::new(1));
    let results = Rc::new(RefCell::new(Vec::new()));
    let content = {
        let input = Rc::clone(&input);
        let results = Rc::clone(&results);
        move |composer: &Composer| {
            let differs = composer.changed(&input.get());
            results.borrow_mut().push(differs);
        }
    };

    composition.set_content_with(content.clone()).expect("pass");
    composition.set_content_with(content.clone()).expect("pass");
    input.set(2);
    composition.set_content_with(content).expect("pass");

    assert_eq!(*results.borrow(), vec![true, false, true]);
}

#[test]
fn changed_instance_compares_identity() {
    let (composition, _) = setup();
    let shared = Rc::new(RefCell::new(Rc::new(5)));
    let results = Rc::new(RefCell::new(Vec::new()));
    let content = {
        let shared = Rc::clone(&shared);
        let results = Rc::clone(&results);
        move |composer: &Composer| {
            let value = Rc::clone(&shared.borrow());
            results.borrow_mut().push(composer.changed_instance(&value));
        }
    };

    composition.set_content_with(content.clone()).expect("pass");
    composition.set_content_with(content.clone()).expect("pass");
    *shared.borrow_mut() = Rc::new(5);
    composition.set_content_with(content).expect("pass");

    assert_eq!(*results.borrow(), vec![true, false, true]);
}

#[test]
fn changed_primitive_compares_floats_by_bits() {
    let (composition, _) = setup();
    let results = Rc::new(RefCell::new(Vec::new()));
    let content = {
        let results = Rc::clone(&results);
        move |composer: &Composer| {
            results.borrow_mut().push(composer.changed_primitive(f64::NAN));
        }
    };

    composition.set_content_with(content.clone()).expect("pass");
    composition.set_content_with(content).expect("pass");

    assert_eq!(*results.borrow(), vec![true, false]);
}

#[test]
fn recall_without_a_stored_value_fails_the_pass() {
    let (composition, _) = setup();

    let err = composition
        .set_content_with(|composer| {
            composer.recall::<String>();
        })
        .expect_err("recall on an empty group");

    match err {
        ComposeError::ComposablePanicked { message } => {
            assert!(message.contains("recall"), "unexpected message: {message}")
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn reordered_keys_move_nodes_and_keep_state() {
    let (composition, ops) = setup();
    let order = Rc::new(RefCell::new(vec![1, 2, 3]));
    let created = Rc::new(Cell::new(0));
    let content = {
        let order = Rc::clone(&order);
        let created = Rc::clone(&created);
        move |composer: &Composer| {
            for id in order.borrow().clone() {
                composer.key(&id, |composer| {
                    let label = composer.remember(|| {
                        created.set(created.get() + 1);
                        format!("item-{id}")
                    });
                    text(composer, &label.get());
                });
            }
        }
    };
    composition.set_content_with(content.clone()).expect("first pass");
    take(&ops);

    *order.borrow_mut() = vec![3, 1, 2];
    composition.set_content_with(content).expect("reorder");

    assert_eq!(take(&ops), vec!["move 1 from 2 to 0"]);
    assert_eq!(created.get(), 3);
    assert_eq!(
        composition.with_applier(|applier| applier.texts()),
        vec!["item-3", "item-1", "item-2"]
    );
}

#[test]
fn dropped_key_forgets_its_state_once() {
    let (composition, _) = setup();
    let events = Events::default();
    let order = Rc::new(RefCell::new(vec![1, 2, 3]));
    let content = {
        let order = Rc::clone(&order);
        let events = Rc::clone(&events);
        move |composer: &Composer| {
            for id in order.borrow().clone() {
                composer.key(&id, |composer| {
                    composer.remember_observer(|| Probe::new(format!("item-{id}"), &events));
                    text(composer, &id.to_string());
                });
            }
        }
    };
    composition.set_content_with(content.clone()).expect("first pass");
    assert_eq!(
        take(&events),
        vec!["remembered item-1", "remembered item-2", "remembered item-3"]
    );

    *order.borrow_mut() = vec![1, 3];
    composition.set_content_with(content.clone()).expect("drop item 2");
    assert_eq!(take(&events), vec!["forgotten item-2"]);
    assert_eq!(composition.with_applier(|applier| applier.texts()), vec!["1", "3"]);

    composition.set_content_with(content).expect("steady");
    assert!(take(&events).is_empty());
}

#[test]
fn duplicate_keys_are_reported() {
    let (composition, _) = setup();

    composition
        .set_content_with(|composer| {
            for id in [7, 7] {
                composer.key(&id, |composer| {
                    text(composer, "dup");
                });
            }
        })
        .expect("pass");

    let diagnostics = composition.take_diagnostics();
    assert_eq!(diagnostics.len(), 1);
    assert!(matches!(
        diagnostics[0],
        Diagnostic::DuplicateKey {
            object_key: Some(_),
            ..
        }
    ));
}

#[test]
fn valid_scope_with_unchanged_inputs_is_skipped() {
    let (composition, ops) = setup();
    let state = mutable_state_of(0);
    let runs = Rc::new(Cell::new(0));
    let content = {
        let state = state.clone();
        let runs = Rc::clone(&runs);
        move |composer: &Composer| {
            let state = state.clone();
            let runs = Rc::clone(&runs);
            composer.restartable(CHILD, false, move |composer| {
                runs.set(runs.get() + 1);
                text(composer, &state.get().to_string());
            });
            text(composer, "sibling");
        }
    };
    composition.set_content_with(content.clone()).expect("first pass");
    composition.set_content_with(content).expect("second pass");
    assert_eq!(runs.get(), 1);
    take(&ops);

    state.set(5);
    assert_eq!(composition.invalidate_states(&[state.id()]), 1);
    assert!(composition.recompose().expect("recompose"));

    assert_eq!(runs.get(), 2);
    assert_eq!(take(&ops), vec!["update 1"]);
    assert_eq!(
        composition.with_applier(|applier| applier.texts()),
        vec!["5", "sibling"]
    );
    assert!(!composition.recompose().expect("nothing left"));
}

#[test]
fn changed_parameters_force_the_body() {
    let (composition, _) = setup();
    let input = Rc::new(Cell::new(1));
    let runs = Rc::new(Cell::new(0));
    let content = {
        let input = Rc::clone(&input);
        let runs = Rc::clone(&runs);
        move |composer: &Composer| {
            let value = input.get();
            composer.start_restartable_group(CHILD);
            let changed = composer.changed(&value);
            if composer.should_execute(changed) {
                runs.set(runs.get() + 1);
            } else {
                composer.skip_current_group();
            }
            composer.end_restartable_group();
        }
    };

    composition.set_content_with(content.clone()).expect("pass");
    composition.set_content_with(content.clone()).expect("pass");
    input.set(2);
    composition.set_content_with(content).expect("pass");

    assert_eq!(runs.get(), 2);
}

#[test]
fn reads_are_recorded_per_scope() {
    let (composition, _) = setup();
    let outer = mutable_state_of(1);
    let inner = mutable_state_of(2);
    let inner_runs = Rc::new(Cell::new(0));
    let content = {
        let outer = outer.clone();
        let inner = inner.clone();
        let inner_runs = Rc::clone(&inner_runs);
        move |composer: &Composer| {
            text(composer, &outer.get().to_string());
            let inner = inner.clone();
            let inner_runs = Rc::clone(&inner_runs);
            composer.restartable(CHILD, false, move |composer| {
                inner_runs.set(inner_runs.get() + 1);
                text(composer, &inner.get().to_string());
            });
        }
    };
    composition.set_content_with(content).expect("pass");

    // The root reads only `outer`; the child scope reads only `inner`.
    assert_eq!(composition.invalidate_states(&[outer.id()]), 1);
    assert!(composition.recompose().expect("recompose root"));
    assert_eq!(inner_runs.get(), 1, "valid child is skipped when the root re-runs");

    assert_eq!(composition.invalidate_states(&[inner.id()]), 1);
    assert!(composition.recompose().expect("recompose child"));
    assert_eq!(inner_runs.get(), 2);
}

#[test]
fn nodes_nest_and_updates_do_not_walk_the_tree() {
    let (composition, ops) = setup();
    let label = Rc::new(RefCell::new(String::from("x")));
    let content = {
        let label = Rc::clone(&label);
        move |composer: &Composer| {
            composer.emit_node(
                0x60,
                Text::default,
                |_| {},
                |composer| {
                    text(composer, &label.borrow());
                },
            );
        }
    };

    composition.set_content_with(content.clone()).expect("first pass");
    assert_eq!(take(&ops), vec!["insert 1 at 0", "down 1", "insert 2 at 0", "update 2", "up"]);

    *label.borrow_mut() = String::from("y");
    composition.set_content_with(content).expect("second pass");
    assert_eq!(take(&ops), vec!["update 2"]);
}

#[test]
fn updater_type_mismatch_surfaces_as_apply_error() {
    let (composition, _) = setup();

    let err = composition
        .set_content_with(|composer| {
            let id = text(composer, "a");
            composer.update_node::<Recordless>(id, |_| {});
        })
        .expect_err("wrong node type");

    assert!(matches!(
        err,
        ComposeError::Apply(NodeError::TypeMismatch { id: 1, .. })
    ));
}

struct Recordless;

impl Node for Recordless {}

#[test]
fn checkpoint_resumes_only_where_it_was_taken() {
    let (composition, _) = setup();
    let outcome = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&outcome);

    composition
        .set_content_with(move |composer| {
            let token = composer.group(1, |composer| {
                let token = composer.checkpoint();
                composer
                    .resume(&token)
                    .expect("same position resumes");
                token
            });
            *sink.borrow_mut() = Some(composer.resume(&token));
        })
        .expect("pass");

    assert!(matches!(
        outcome.borrow_mut().take(),
        Some(Err(ComposeError::SuspensionMismatch { .. }))
    ));
}

#[test]
fn locals_resolve_to_the_nearest_provider() {
    let (composition, _) = setup();
    let theme = composition_local_of(|| String::from("default"));
    let seen = Rc::new(RefCell::new(Vec::new()));
    let content = {
        let theme = theme.clone();
        let seen = Rc::clone(&seen);
        move |composer: &Composer| {
            seen.borrow_mut().push(composer.current(&theme));
            composer.provide(&theme, String::from("dark"), |composer| {
                seen.borrow_mut().push(composer.current(&theme));
                composer.provide(&theme, String::from("contrast"), |composer| {
                    seen.borrow_mut().push(composer.current(&theme));
                });
                seen.borrow_mut().push(composer.current(&theme));
            });
        }
    };

    composition.set_content_with(content).expect("pass");

    assert_eq!(*seen.borrow(), vec!["default", "dark", "contrast", "dark"]);
}

#[test]
fn invalidating_the_running_scope_schedules_another_pass() {
    let (composition, _) = setup();
    let runs = Rc::new(Cell::new(0));
    let content = {
        let runs = Rc::clone(&runs);
        move |composer: &Composer| {
            let runs = Rc::clone(&runs);
            composer.restartable(CHILD, false, move |composer| {
                runs.set(runs.get() + 1);
                if runs.get() == 1 {
                    composer.invalidate();
                }
            });
        }
    };

    composition.set_content_with(content).expect("pass");
    assert!(composition.has_invalidations());
    assert!(composition.recompose().expect("recompose"));

    assert_eq!(runs.get(), 2);
    assert!(!composition.has_invalidations());
}

#[test]
#[should_panic(expected = "should_execute called outside of a restartable group")]
fn should_execute_needs_a_restartable_group() {
    let composer = Composer::new(SchedulerContext::new(Arc::new(NoopScheduler)));
    composer.begin_pass();
    composer.should_execute(false);
}
