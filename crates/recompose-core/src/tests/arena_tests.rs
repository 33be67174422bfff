use super::*;

#[test]
fn removed_slot_is_reused_with_new_generation() {
    let mut arena = GenerationalArena::new();
    let first = arena.insert("first");
    assert_eq!(arena.remove(first), Some("first"));
    let second = arena.insert("second");

    assert_eq!(first.index(), second.index());
    assert_ne!(first.generation(), second.generation());
    assert_eq!(arena.get(first), None);
    assert_eq!(arena.get(second), Some(&"second"));
}

#[test]
fn stale_remove_leaves_new_entry_alone() {
    let mut arena = GenerationalArena::new();
    let stale = arena.insert(1);
    arena.remove(stale);
    let live = arena.insert(2);

    assert_eq!(arena.remove(stale), None);
    assert_eq!(arena.len(), 1);
    assert!(arena.contains(live));
}

#[test]
fn retain_evicts_rejected_entries() {
    let mut arena = GenerationalArena::new();
    let ids: Vec<_> = (0..6).map(|value| arena.insert(value)).collect();

    arena.retain(|_, value| *value % 2 == 0);

    assert_eq!(arena.len(), 3);
    for (value, id) in ids.iter().enumerate() {
        assert_eq!(arena.contains(*id), value % 2 == 0);
    }
    let remaining: Vec<i32> = arena.iter().map(|(_, value)| *value).collect();
    assert_eq!(remaining, vec![0, 2, 4]);
}

#[test]
fn get_mut_respects_generation() {
    let mut arena = GenerationalArena::new();
    let id = arena.insert(String::from("a"));
    arena.get_mut(id).unwrap().push('b');
    assert_eq!(arena.get(id).map(String::as_str), Some("ab"));

    arena.remove(id);
    assert!(arena.get_mut(id).is_none());
    assert!(arena.is_empty());
}

#[test]
fn insert_with_sees_its_own_id() {
    let mut arena = GenerationalArena::new();
    let fresh = arena.insert_with(|id| id);
    assert_eq!(arena.get(fresh), Some(&fresh));

    arena.remove(fresh);
    let reused = arena.insert_with(|id| id);
    assert_eq!(arena.get(reused), Some(&reused));
    assert_eq!(reused.index(), fresh.index());
    assert_ne!(reused, fresh);
}
