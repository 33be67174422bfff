use super::*;

#[derive(Debug)]
struct Item {
    value: u32,
    anchor: Option<Anchor>,
}

impl Item {
    fn new(value: u32) -> Self {
        Self {
            value,
            anchor: None,
        }
    }
}

impl Anchored for Item {
    fn anchor(&self) -> Option<&Anchor> {
        self.anchor.as_ref()
    }

    fn anchor_slot(&mut self) -> Option<&mut Option<Anchor>> {
        Some(&mut self.anchor)
    }
}

fn values(buffer: &GapBuffer<Item>) -> Vec<u32> {
    buffer.iter().map(|item| item.value).collect()
}

fn filled(count: u32) -> GapBuffer<Item> {
    let mut buffer = GapBuffer::new();
    for value in 0..count {
        buffer.insert(value as usize, Item::new(value));
    }
    buffer
}

#[test]
fn inserts_at_arbitrary_positions() {
    let mut buffer = filled(3);
    buffer.insert(1, Item::new(10));
    buffer.insert(0, Item::new(20));
    buffer.insert(5, Item::new(30));

    assert_eq!(values(&buffer), vec![20, 0, 10, 1, 2, 30]);
    assert_eq!(buffer.len(), 6);
    assert_eq!(buffer.get(2).map(|item| item.value), Some(10));
    assert!(buffer.get(6).is_none());
}

#[test]
fn anchors_follow_gap_moves_and_growth() {
    let mut buffer = filled(4);
    let anchor = buffer.anchor(3).expect("anchor");

    buffer.insert(0, Item::new(99));
    assert_eq!(buffer.resolve(&anchor), Some(4));

    for value in 100..140 {
        buffer.insert(1, Item::new(value));
    }
    assert_eq!(buffer.resolve(&anchor), Some(44));
    assert_eq!(buffer.get(44).map(|item| item.value), Some(3));

    buffer.remove(0);
    assert_eq!(buffer.resolve(&anchor), Some(43));
}

#[test]
fn anchor_is_created_once() {
    let mut buffer = filled(2);
    let first = buffer.anchor(1).expect("anchor");
    let second = buffer.anchor(1).expect("anchor");
    assert!(first.ptr_eq(&second));
}

#[test]
fn removed_range_can_be_reinserted_elsewhere() {
    let mut buffer = filled(6);
    let anchor = buffer.anchor(4).expect("anchor");

    let moved = buffer.remove_range(3, 2);
    buffer.insert_many(0, moved);

    assert_eq!(values(&buffer), vec![3, 4, 0, 1, 2, 5]);
    assert_eq!(buffer.resolve(&anchor), Some(1));
}

#[test]
fn invalidated_anchor_resolves_to_none() {
    let mut buffer = filled(3);
    let anchor = buffer.anchor(1).expect("anchor");
    let removed = buffer.remove(1);
    anchor.invalidate();

    assert_eq!(removed.value, 1);
    assert_eq!(buffer.resolve(&anchor), None);
    assert_eq!(values(&buffer), vec![0, 2]);
}

#[test]
fn clear_drains_in_order() {
    let mut buffer = filled(5);
    buffer.insert(2, Item::new(7));

    let drained: Vec<u32> = buffer.clear().into_iter().map(|item| item.value).collect();

    assert_eq!(drained, vec![0, 1, 7, 2, 3, 4]);
    assert!(buffer.is_empty());
}
