//! Document-loop behavior: checkpoints, GC, snapshots, presence, undo/redo,
//! validation and the event surface.

use std::cell::RefCell;
use std::rc::Rc;

use codoc::protocol::{JsonType, RuleBasedValidator, SchemaRule};
use codoc::{
    ActorId, ChangePack, Checkpoint, DocError, DocEvent, DocStatus, Document, DocumentOptions,
    PrimitiveValue, Snapshot, Topic, VersionVector, WatchDocumentResponse, WatchEvent,
    ACTOR_ID_SIZE,
};
use serde_json::json;

fn actor(n: u8) -> ActorId {
    let mut bytes = [0u8; ACTOR_ID_SIZE];
    bytes[ACTOR_ID_SIZE - 1] = n;
    ActorId::from_bytes(bytes)
}

fn new_doc(n: u8) -> Document {
    let mut doc = Document::new("doc");
    doc.set_actor(actor(n));
    doc
}

fn text_content(doc: &Document, key: &str) -> String {
    doc.to_json()[key]
        .as_array()
        .map(|blocks| {
            blocks.iter().map(|b| b["val"].as_str().unwrap_or("").to_string()).collect()
        })
        .unwrap_or_default()
}

#[test]
fn garbage_collects_removed_text_range() {
    let mut doc = new_doc(1);
    doc.update(|r| {
        let t = r.set_text(r.root_object(), "t")?;
        r.edit(t, 0, 0, "abc")
    })
    .unwrap();
    doc.update(|r| {
        let t = r.text(r.root_object(), "t")?;
        r.edit(t, 1, 2, "")
    })
    .unwrap();
    assert_eq!(text_content(&doc, "t"), "ac");
    assert!(doc.doc_size().gc.total() > 0);

    // Every peer has seen the removal once the threshold covers its
    // lamport; the tombstone block is unlinked.
    let min_vv = doc.change_id().version_vector().clone();
    let purged = doc.garbage_collect(&min_vv);
    assert!(purged >= 1, "expected at least one purge, got {}", purged);
    assert_eq!(doc.doc_size().gc.total(), 0);
    assert_eq!(text_content(&doc, "t"), "ac");
    doc.root().check();
}

#[test]
fn gc_respects_a_lagging_peer() {
    let mut doc = new_doc(1);
    doc.update(|r| {
        let t = r.set_text(r.root_object(), "t")?;
        r.edit(t, 0, 0, "abc")
    })
    .unwrap();
    doc.update(|r| {
        let t = r.text(r.root_object(), "t")?;
        r.edit(t, 0, 3, "")
    })
    .unwrap();

    // A vector below the removal lamport purges nothing.
    let mut lagging = VersionVector::new();
    lagging.set(actor(1), 1);
    assert_eq!(doc.garbage_collect(&lagging), 0);
    assert!(doc.doc_size().gc.total() > 0);
    doc.root().check();
}

#[test]
fn disable_gc_skips_collection() {
    let mut doc = Document::with_options(
        "doc",
        DocumentOptions { disable_gc: true, ..Default::default() },
    );
    doc.set_actor(actor(1));
    doc.update(|r| {
        let t = r.set_text(r.root_object(), "t")?;
        r.edit(t, 0, 0, "abc")
    })
    .unwrap();
    doc.update(|r| {
        let t = r.text(r.root_object(), "t")?;
        r.edit(t, 0, 1, "")
    })
    .unwrap();
    let vv = doc.change_id().version_vector().clone();
    assert_eq!(doc.garbage_collect(&vv), 0);
    assert!(doc.doc_size().gc.total() > 0);
}

#[test]
fn presence_only_change_consumes_no_lamport() {
    let mut doc = new_doc(1);
    doc.update(|r| r.set(r.root_object(), "x", PrimitiveValue::Integer(1))).unwrap();
    let lamport_before = doc.change_id().lamport();
    let changes_before = doc.local_changes().len();

    doc.update(|r| {
        r.presence_set_with_history(&[("cursor", json!(2))]);
        Ok(())
    })
    .unwrap();

    assert_eq!(doc.local_changes().len(), changes_before + 1);
    let change = doc.local_changes().last().unwrap();
    assert!(change.is_presence_only());
    assert_eq!(change.id().lamport(), lamport_before);
    assert_eq!(doc.change_id().lamport(), lamport_before);
    assert_eq!(doc.my_presence().get("cursor"), Some(&json!(2)));

    // Undo restores the previous presence map.
    doc.undo().unwrap();
    assert_eq!(doc.my_presence().get("cursor"), None);
}

#[test]
fn snapshot_drops_acked_and_replays_pending_changes() {
    // Server-side state the snapshot carries.
    let mut server = new_doc(9);
    server.update(|r| r.set(r.root_object(), "base", PrimitiveValue::Integer(1))).unwrap();
    let snapshot = Snapshot {
        root: server.root().clone(),
        presences: server.presences().clone(),
    };
    let snapshot_vv = server.change_id().version_vector().clone();

    let mut doc = new_doc(1);
    doc.update(|r| r.set(r.root_object(), "a", PrimitiveValue::Integer(10))).unwrap(); // seq 1
    doc.update(|r| r.set(r.root_object(), "b", PrimitiveValue::Integer(20))).unwrap(); // seq 2

    let snapshots_seen = Rc::new(RefCell::new(0));
    let sink = snapshots_seen.clone();
    doc.subscribe(
        Topic::Default,
        Box::new(move |e| {
            if matches!(e, DocEvent::Snapshot { .. }) {
                *sink.borrow_mut() += 1;
            }
        }),
    );

    let mut pack = ChangePack::new("doc", Checkpoint::new(1, 5), Vec::new());
    pack.snapshot = Some(snapshot);
    pack.snapshot_version_vector = Some(snapshot_vv);
    doc.apply_change_pack(pack).unwrap();

    // The acked change is gone, the pending one was replayed on top.
    assert_eq!(doc.local_changes().len(), 1);
    assert_eq!(doc.to_json()["base"], json!(1));
    assert_eq!(doc.to_json()["a"], json!(null));
    assert_eq!(doc.to_json()["b"], json!(20));
    assert_eq!(*snapshots_seen.borrow(), 1);
    assert_eq!(doc.checkpoint(), Checkpoint::new(1, 5));
    doc.root().check();
}

#[test]
fn checkpoints_advance_pointwise() {
    let mut doc = new_doc(1);
    doc.apply_change_pack(ChangePack::new("doc", Checkpoint::new(3, 10), Vec::new())).unwrap();
    assert_eq!(doc.checkpoint(), Checkpoint::new(3, 10));
    // A stale pack never rolls the watermark back.
    doc.apply_change_pack(ChangePack::new("doc", Checkpoint::new(1, 4), Vec::new())).unwrap();
    assert_eq!(doc.checkpoint(), Checkpoint::new(3, 10));
    doc.apply_change_pack(ChangePack::new("doc", Checkpoint::new(4, 7), Vec::new())).unwrap();
    assert_eq!(doc.checkpoint(), Checkpoint::new(4, 10));
}

#[test]
fn undo_restores_the_previous_document(){
    let mut doc = new_doc(1);
    doc.update(|r| {
        let t = r.set_text(r.root_object(), "t")?;
        r.edit(t, 0, 0, "hello world")?;
        r.set(r.root_object(), "title", PrimitiveValue::Str("old".into()))?;
        let c = r.set_counter(r.root_object(), "n", 5)?;
        r.increase(c, 0)
    })
    .unwrap();
    let before = doc.to_sorted_json_string();
    let presence_before = doc.my_presence();

    doc.update(|r| {
        let t = r.text(r.root_object(), "t")?;
        r.edit(t, 5, 11, "!")?;
        r.style(t, 0, 3, &[("b", "1")])?;
        r.set(r.root_object(), "title", PrimitiveValue::Str("new".into()))?;
        let c = r.counter(r.root_object(), "n")?;
        r.increase(c, 7)?;
        r.presence_set_with_history(&[("cursor", json!(6))]);
        Ok(())
    })
    .unwrap();
    assert_ne!(doc.to_sorted_json_string(), before);

    doc.undo().unwrap();
    assert_eq!(doc.to_sorted_json_string(), before, "undo must restore the exact document");
    assert_eq!(doc.my_presence(), presence_before);
    doc.root().check();

    // And redo brings the mutation back.
    doc.redo().unwrap();
    assert_eq!(text_content(&doc, "t"), "hello!");
    assert_eq!(doc.to_json()["title"], json!("new"));
    assert_eq!(doc.to_json()["n"], json!(12));
    doc.root().check();
}

#[test]
fn undo_of_member_removal_rebuilds_the_subtree() {
    let mut doc = new_doc(1);
    doc.update(|r| {
        let obj = r.set_object(r.root_object(), "user")?;
        r.set(obj, "name", PrimitiveValue::Str("ada".into()))?;
        let arr = r.set_array(obj, "tags")?;
        r.push(arr, PrimitiveValue::Integer(1))?;
        r.push(arr, PrimitiveValue::Integer(2))
    })
    .unwrap();
    let before = doc.to_sorted_json_string();

    doc.update(|r| r.remove(r.root_object(), "user")).unwrap();
    assert_eq!(doc.to_sorted_json_string(), "{}");

    doc.undo().unwrap();
    assert_eq!(doc.to_sorted_json_string(), before);
    doc.root().check();
}

#[test]
fn undo_refuses_without_history_or_during_update() {
    let mut doc = new_doc(1);
    assert!(matches!(doc.undo(), Err(DocError::Refused(_))));
    assert!(!doc.can_undo());

    doc.update(|r| r.set(r.root_object(), "x", PrimitiveValue::Integer(1))).unwrap();
    assert!(doc.can_undo());
}

#[test]
fn schema_violation_rolls_the_update_back() {
    let options = DocumentOptions {
        schema_validator: Some(Box::new(RuleBasedValidator {
            rules: vec![SchemaRule { path: "$.title".into(), expected: JsonType::String }],
        })),
        ..Default::default()
    };
    let mut doc = Document::with_options("doc", options);
    doc.set_actor(actor(1));

    let err = doc
        .update(|r| r.set(r.root_object(), "title", PrimitiveValue::Integer(3)))
        .unwrap_err();
    assert!(matches!(err, DocError::SchemaValidationFailed { .. }));
    assert_eq!(doc.to_sorted_json_string(), "{}");
    assert!(doc.local_changes().is_empty());

    doc.update(|r| r.set(r.root_object(), "title", PrimitiveValue::Str("ok".into()))).unwrap();
    assert_eq!(doc.to_json()["title"], json!("ok"));
}

#[test]
fn size_limit_rejects_an_oversized_update() {
    let options = DocumentOptions { max_size_limit: 200, ..Default::default() };
    let mut doc = Document::with_options("doc", options);
    doc.set_actor(actor(1));

    let err = doc
        .update(|r| {
            let t = r.set_text(r.root_object(), "t")?;
            r.edit(t, 0, 0, &"x".repeat(500))
        })
        .unwrap_err();
    assert!(matches!(err, DocError::SizeExceedsLimit { .. }));
    assert_eq!(doc.to_sorted_json_string(), "{}");

    doc.update(|r| r.set(r.root_object(), "small", PrimitiveValue::Integer(1))).unwrap();
    assert_eq!(doc.to_json()["small"], json!(1));
}

#[test]
fn failing_mutator_leaves_the_root_untouched() {
    let mut doc = new_doc(1);
    doc.update(|r| r.set(r.root_object(), "x", PrimitiveValue::Integer(1))).unwrap();
    let before = doc.to_sorted_json_string();

    let err = doc.update(|r| {
        r.set(r.root_object(), "y", PrimitiveValue::Integer(2))?;
        Err(DocError::invalid_argument("mutator bails"))
    });
    assert!(err.is_err());
    assert_eq!(doc.to_sorted_json_string(), before);

    // The discarded clone must not leak the aborted write into later
    // updates either.
    doc.update(|r| r.set(r.root_object(), "z", PrimitiveValue::Integer(3))).unwrap();
    assert_eq!(doc.to_json()["y"], json!(null));
    assert_eq!(doc.to_json()["z"], json!(3));
}

#[test]
fn removed_documents_refuse_writes() {
    let mut doc = new_doc(1);
    let mut pack = ChangePack::new("doc", Checkpoint::new(0, 1), Vec::new());
    pack.is_removed = true;
    doc.apply_change_pack(pack).unwrap();
    assert_eq!(doc.status(), DocStatus::Removed);
    assert!(matches!(
        doc.update(|r| r.set(r.root_object(), "x", PrimitiveValue::Integer(1))),
        Err(DocError::DocumentRemoved)
    ));
}

#[test]
fn size_accounting_matches_a_recount() {
    // P7: live + gc always equals a recount over every surviving node.
    let mut doc = new_doc(1);
    doc.update(|r| {
        let t = r.set_text(r.root_object(), "t")?;
        r.edit(t, 0, 0, "hello world")?;
        r.set(r.root_object(), "k", PrimitiveValue::Str("v".into()))
    })
    .unwrap();
    doc.root().check();

    doc.update(|r| {
        let t = r.text(r.root_object(), "t")?;
        r.edit(t, 2, 7, "XY")?;
        r.style(t, 0, 4, &[("b", "1")])?;
        r.style(t, 0, 2, &[("b", "2")])
    })
    .unwrap();
    doc.root().check();

    doc.update(|r| r.remove(r.root_object(), "k")).unwrap();
    doc.root().check();

    let vv = doc.change_id().version_vector().clone();
    doc.garbage_collect(&vv);
    doc.root().check();
}

#[test]
fn watch_stream_drives_presence_events() {
    let mut doc = new_doc(1);
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    doc.subscribe(
        Topic::Presence,
        Box::new(move |e| {
            sink.borrow_mut().push(match e {
                DocEvent::Initialized { .. } => "initialized",
                DocEvent::Watched { .. } => "watched",
                DocEvent::Unwatched { .. } => "unwatched",
                DocEvent::PresenceChanged { .. } => "presence-changed",
                _ => "other",
            });
        }),
    );

    doc.apply_watch_stream(WatchDocumentResponse::Initialization {
        client_ids: vec![actor(1)],
    });
    doc.apply_watch_stream(WatchDocumentResponse::Event(WatchEvent::DocumentWatched {
        publisher: actor(2),
    }));

    // The peer's first presence arrives through a remote change: Watched.
    let mut peer = new_doc(2);
    peer.update(|r| {
        r.presence_set(&[("cursor", json!(0))]);
        Ok(())
    })
    .unwrap();
    let change = peer.local_changes().last().unwrap().clone();
    doc.apply_change(change, codoc::OpSource::Remote).unwrap();

    // A later presence update from a known client: PresenceChanged.
    peer.update(|r| {
        r.presence_set(&[("cursor", json!(3))]);
        Ok(())
    })
    .unwrap();
    let change = peer.local_changes().last().unwrap().clone();
    doc.apply_change(change, codoc::OpSource::Remote).unwrap();

    doc.apply_watch_stream(WatchDocumentResponse::Event(WatchEvent::DocumentUnwatched {
        publisher: actor(2),
    }));

    assert_eq!(
        *events.borrow(),
        vec!["initialized", "watched", "presence-changed", "unwatched"]
    );
}

#[test]
fn broadcast_round_trip() {
    let mut doc = new_doc(1);
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    doc.subscribe(
        Topic::Broadcast,
        Box::new(move |e| {
            if let DocEvent::Broadcast { topic, payload } = e {
                sink.borrow_mut().push((topic.to_string(), payload.clone()));
            }
        }),
    );
    let locals = Rc::new(RefCell::new(0));
    let sink = locals.clone();
    doc.subscribe(
        Topic::LocalBroadcast,
        Box::new(move |e| {
            if matches!(e, DocEvent::LocalBroadcast { .. }) {
                *sink.borrow_mut() += 1;
            }
        }),
    );

    doc.broadcast("chat", json!({"msg": "hi"}));
    assert_eq!(*locals.borrow(), 1);

    doc.apply_watch_stream(WatchDocumentResponse::Event(WatchEvent::DocumentBroadcast {
        publisher: actor(2),
        topic: "chat".into(),
        payload: serde_json::to_vec(&json!({"msg": "yo"})).unwrap(),
    }));
    assert_eq!(*events.borrow(), vec![("chat".to_string(), json!({"msg": "yo"}))]);
}

#[test]
fn path_subscriptions_filter_change_events() {
    let mut doc = new_doc(1);
    let hits = Rc::new(RefCell::new(0));
    let sink = hits.clone();
    doc.subscribe(
        Topic::Path("$.todos".into()),
        Box::new(move |_| {
            *sink.borrow_mut() += 1;
        }),
    );

    doc.update(|r| {
        let arr = r.set_array(r.root_object(), "todos")?;
        r.push(arr, PrimitiveValue::Str("one".into()))
    })
    .unwrap();
    doc.update(|r| r.set(r.root_object(), "other", PrimitiveValue::Integer(1))).unwrap();

    // Only the change touching $.todos reached the subscriber.
    assert_eq!(*hits.borrow(), 1);
}

#[test]
fn devtools_attach_raw_changes() {
    let mut doc = Document::with_options(
        "doc",
        DocumentOptions { enable_devtools: true, ..Default::default() },
    );
    doc.set_actor(actor(1));
    let raw = Rc::new(RefCell::new(0));
    let sink = raw.clone();
    doc.subscribe(
        Topic::Default,
        Box::new(move |e| {
            if let DocEvent::LocalChange { info } = e {
                if info.raw_change.is_some() {
                    *sink.borrow_mut() += 1;
                }
            }
        }),
    );
    doc.update(|r| r.set(r.root_object(), "x", PrimitiveValue::Integer(1))).unwrap();
    assert_eq!(*raw.borrow(), 1);
}

#[test]
fn array_move_and_set_round_trip() {
    let mut doc = new_doc(1);
    doc.update(|r| {
        let arr = r.set_array(r.root_object(), "list")?;
        r.push(arr, PrimitiveValue::Integer(1))?;
        r.push(arr, PrimitiveValue::Integer(2))?;
        r.push(arr, PrimitiveValue::Integer(3))
    })
    .unwrap();
    assert_eq!(doc.to_json()["list"], json!([1, 2, 3]));

    doc.update(|r| {
        let arr = r.array(r.root_object(), "list")?;
        r.move_after(arr, 2, None)
    })
    .unwrap();
    assert_eq!(doc.to_json()["list"], json!([3, 1, 2]));

    doc.update(|r| {
        let arr = r.array(r.root_object(), "list")?;
        r.set_at(arr, 1, PrimitiveValue::Integer(10))
    })
    .unwrap();
    assert_eq!(doc.to_json()["list"], json!([3, 10, 2]));

    doc.undo().unwrap();
    assert_eq!(doc.to_json()["list"], json!([3, 1, 2]));
    doc.root().check();
}
