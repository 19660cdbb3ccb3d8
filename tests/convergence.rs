//! Two-client convergence: concurrent edits exchanged through change packs
//! must agree byte-for-byte, whatever the interleaving.

use codoc::{
    ActorId, ChangePack, Checkpoint, Document, OpSource, VersionVector, ACTOR_ID_SIZE,
};
use rand::prelude::*;

fn actor(n: u8) -> ActorId {
    let mut bytes = [0u8; ACTOR_ID_SIZE];
    bytes[ACTOR_ID_SIZE - 1] = n;
    ActorId::from_bytes(bytes)
}

fn text_content(doc: &Document, key: &str) -> String {
    doc.to_json()[key]
        .as_array()
        .map(|blocks| {
            blocks.iter().map(|b| b["val"].as_str().unwrap_or("").to_string()).collect()
        })
        .unwrap_or_default()
}

/// Ships `from`'s pending changes to `to` and acks them, the way the server
/// round-trips a push/pull.
fn sync(from: &mut Document, to: &mut Document, server_seq: &mut u64) {
    let changes = from.local_changes().to_vec();
    if changes.is_empty() {
        return;
    }
    *server_seq += changes.len() as u64;
    let acked = changes.last().map(|c| c.id().client_seq()).unwrap_or(0);

    let mut pack = ChangePack::new(to.key(), Checkpoint::new(0, *server_seq), changes);
    pack.version_vector = VersionVector::new();
    to.apply_change_pack(pack).unwrap();

    let ack = ChangePack::new(from.key(), Checkpoint::new(acked, *server_seq), Vec::new());
    from.apply_change_pack(ack).unwrap();
}

/// A pair of documents sharing a text element at `"t"`.
fn text_pair() -> (Document, Document, u64) {
    let mut a = Document::new("doc");
    a.set_actor(actor(1));
    let mut b = Document::new("doc");
    b.set_actor(actor(2));
    a.update(|r| {
        r.set_text(r.root_object(), "t")?;
        Ok(())
    })
    .unwrap();
    let mut server_seq = 0;
    sync(&mut a, &mut b, &mut server_seq);
    (a, b, server_seq)
}

#[test]
fn concurrent_inserts_at_the_same_position() {
    let (mut a, mut b, mut seq) = text_pair();

    a.update(|r| {
        let t = r.text(r.root_object(), "t")?;
        r.edit(t, 0, 0, "a")
    })
    .unwrap();
    b.update(|r| {
        let t = r.text(r.root_object(), "t")?;
        r.edit(t, 0, 0, "b")
    })
    .unwrap();

    sync(&mut a, &mut b, &mut seq);
    sync(&mut b, &mut a, &mut seq);

    assert_eq!(a.to_sorted_json_string(), b.to_sorted_json_string());
    // b carries the later clock, and the later ticket takes the slot next
    // to the anchor.
    assert_eq!(text_content(&a, "t"), "ba");
    a.root().check();
    b.root().check();
}

#[test]
fn insert_into_concurrently_deleted_range() {
    let (mut a, mut b, mut seq) = text_pair();
    a.update(|r| {
        let t = r.text(r.root_object(), "t")?;
        r.edit(t, 0, 0, "hello")
    })
    .unwrap();
    sync(&mut a, &mut b, &mut seq);

    // a deletes [1, 4) while b, not having seen it, inserts at 3.
    a.update(|r| {
        let t = r.text(r.root_object(), "t")?;
        r.edit(t, 1, 4, "")
    })
    .unwrap();
    b.update(|r| {
        let t = r.text(r.root_object(), "t")?;
        r.edit(t, 3, 3, "X")
    })
    .unwrap();

    sync(&mut a, &mut b, &mut seq);
    sync(&mut b, &mut a, &mut seq);

    assert_eq!(text_content(&a, "t"), "hXo");
    assert_eq!(text_content(&b, "t"), "hXo");
    assert_eq!(a.to_sorted_json_string(), b.to_sorted_json_string());
    a.root().check();
    b.root().check();
}

#[test]
fn concurrent_changes_commute() {
    // The same two concurrent changes applied in either order produce
    // bit-identical sorted JSON.
    let (mut a, mut b, mut seq) = text_pair();
    a.update(|r| {
        let t = r.text(r.root_object(), "t")?;
        r.edit(t, 0, 0, "base")
    })
    .unwrap();
    sync(&mut a, &mut b, &mut seq);

    a.update(|r| {
        let t = r.text(r.root_object(), "t")?;
        r.edit(t, 0, 2, "AA")?;
        r.set(r.root_object(), "from", codoc::PrimitiveValue::Str("a".into()))
    })
    .unwrap();
    b.update(|r| {
        let t = r.text(r.root_object(), "t")?;
        r.edit(t, 2, 4, "BB")?;
        r.style(t, 0, 2, &[("bold", "true")])
    })
    .unwrap();

    let from_a = a.local_changes().to_vec();
    let from_b = b.local_changes().to_vec();

    // Order 1: a's changes then b's; order 2: the reverse.
    for change in from_b.iter().chain(from_a.iter()) {
        a.apply_change(change.clone(), OpSource::Remote).unwrap();
    }
    for change in from_a.iter().chain(from_b.iter()) {
        b.apply_change(change.clone(), OpSource::Remote).unwrap();
    }

    assert_eq!(a.to_sorted_json_string(), b.to_sorted_json_string());
    a.root().check();
    b.root().check();
}

#[test]
fn reapplying_a_change_is_a_no_op() {
    // Idempotent apply: the second application of the same change
    // finds nothing left to do.
    let (mut a, mut b, mut seq) = text_pair();
    a.update(|r| {
        let t = r.text(r.root_object(), "t")?;
        r.edit(t, 0, 0, "abc")
    })
    .unwrap();
    a.update(|r| {
        let t = r.text(r.root_object(), "t")?;
        r.edit(t, 1, 2, "")
    })
    .unwrap();

    let changes = a.local_changes().to_vec();
    for change in &changes {
        b.apply_change(change.clone(), OpSource::Remote).unwrap();
    }
    let once = b.to_sorted_json_string();
    for change in &changes {
        b.apply_change(change.clone(), OpSource::Remote).unwrap();
    }
    assert_eq!(b.to_sorted_json_string(), once);
    assert_eq!(text_content(&b, "t"), "ac");
    b.root().check();
    let _ = seq;
}

#[test]
fn concurrent_object_sets_pick_one_winner() {
    let (mut a, mut b, mut seq) = text_pair();
    a.update(|r| r.set(r.root_object(), "k", codoc::PrimitiveValue::Integer(1))).unwrap();
    b.update(|r| r.set(r.root_object(), "k", codoc::PrimitiveValue::Integer(2))).unwrap();

    sync(&mut a, &mut b, &mut seq);
    sync(&mut b, &mut a, &mut seq);

    assert_eq!(a.to_sorted_json_string(), b.to_sorted_json_string());
    a.root().check();
    b.root().check();
}

#[test]
fn concurrent_array_edits_converge() {
    let mut a = Document::new("doc");
    a.set_actor(actor(1));
    let mut b = Document::new("doc");
    b.set_actor(actor(2));
    a.update(|r| {
        let arr = r.set_array(r.root_object(), "list")?;
        r.push(arr, codoc::PrimitiveValue::Integer(1))?;
        r.push(arr, codoc::PrimitiveValue::Integer(2))
    })
    .unwrap();
    let mut seq = 0;
    sync(&mut a, &mut b, &mut seq);

    a.update(|r| {
        let arr = r.array(r.root_object(), "list")?;
        r.insert(arr, 0, codoc::PrimitiveValue::Integer(10))
    })
    .unwrap();
    b.update(|r| {
        let arr = r.array(r.root_object(), "list")?;
        r.remove_at(arr, 1)?;
        r.push(arr, codoc::PrimitiveValue::Integer(20))
    })
    .unwrap();

    sync(&mut a, &mut b, &mut seq);
    sync(&mut b, &mut a, &mut seq);

    assert_eq!(a.to_sorted_json_string(), b.to_sorted_json_string());
    a.root().check();
    b.root().check();
}

fn random_text_edit(doc: &mut Document, rng: &mut SmallRng) {
    let content = text_content(doc, "t");
    let len = content.chars().count();
    let alphabet: Vec<char> = "abcdefghij".chars().collect();
    doc.update(|r| {
        let t = r.text(r.root_object(), "t")?;
        if len == 0 || rng.gen_bool(0.6) {
            let pos = rng.gen_range(0..=len);
            let ins_len = rng.gen_range(1..3);
            let mut s = String::new();
            for _ in 0..ins_len {
                s.push(*alphabet.choose(rng).unwrap());
            }
            r.edit(t, pos, pos, &s)
        } else if rng.gen_bool(0.8) {
            let from = rng.gen_range(0..len);
            let to = rng.gen_range(from + 1..=len.min(from + 5));
            r.edit(t, from, to, "")
        } else {
            let from = rng.gen_range(0..len);
            let to = rng.gen_range(from + 1..=len.min(from + 4));
            r.style(t, from, to, &[("b", "1")])
        }
    })
    .unwrap();
}

#[test]
fn random_two_client_edits_converge() {
    let mut rng = SmallRng::seed_from_u64(7);
    let (mut a, mut b, mut seq) = text_pair();

    for round in 0..30 {
        for _ in 0..rng.gen_range(1..4) {
            random_text_edit(&mut a, &mut rng);
        }
        for _ in 0..rng.gen_range(1..4) {
            random_text_edit(&mut b, &mut rng);
        }
        sync(&mut a, &mut b, &mut seq);
        sync(&mut b, &mut a, &mut seq);

        assert_eq!(
            a.to_sorted_json_string(),
            b.to_sorted_json_string(),
            "diverged in round {}",
            round
        );
        a.root().check();
        b.root().check();
    }
}
