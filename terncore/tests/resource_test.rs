use tern_proto::core::WireExpr;
use terncore::session::resource::{ResourceSpace, ResourceTables};

#[test]
fn register_expand_unregister_lifecycle() {
    let mut space = ResourceSpace::default();
    let full = space
        .register(1, &WireExpr::from_str("foo/bar"))
        .unwrap();
    assert_eq!(full, "foo/bar");

    // While registered, a suffixed expression expands through the RID.
    let expanded = space
        .expand(&WireExpr {
            scope: 1,
            suffix: "/baz".into(),
        })
        .unwrap();
    assert_eq!(expanded, "foo/bar/baz");

    space.unregister(1);
    assert!(space.expand(&WireExpr::from_rid(1)).is_err());
}

#[test]
fn suffixed_registration_holds_its_base() {
    let mut space = ResourceSpace::default();
    space.register(1, &WireExpr::from_str("foo/bar")).unwrap();
    let full = space
        .register(
            2,
            &WireExpr {
                scope: 1,
                suffix: "/baz".into(),
            },
        )
        .unwrap();
    assert_eq!(full, "foo/bar/baz");

    // The base survives its own unregistration while RID 2 refers to it.
    space.unregister(1);
    assert!(space.contains(1));
    assert_eq!(space.expand(&WireExpr::from_rid(2)).unwrap(), "foo/bar/baz");

    // Releasing the suffixed entry releases the base with it.
    space.unregister(2);
    assert!(!space.contains(2));
    assert!(!space.contains(1));
}

#[test]
fn redeclaring_a_rid_with_a_different_key_is_rejected() {
    let mut space = ResourceSpace::default();
    space.register(1, &WireExpr::from_str("foo/bar")).unwrap();
    assert!(space.register(1, &WireExpr::from_str("other/key")).is_err());
    // Same key is a refcount bump, not an error.
    space.register(1, &WireExpr::from_str("foo/bar")).unwrap();
    space.unregister(1);
    assert!(space.contains(1));
    space.unregister(1);
    assert!(!space.contains(1));
}

#[test]
fn remote_spaces_are_scoped_per_peer() {
    use tern_transport::PeerId;

    let mut tables = ResourceTables::default();
    tables
        .remote(Some(PeerId(1)))
        .register(7, &WireExpr::from_str("foo/bar"))
        .unwrap();
    tables
        .remote(Some(PeerId(2)))
        .register(7, &WireExpr::from_str("quu/x"))
        .unwrap();

    let wire = WireExpr {
        scope: 7,
        suffix: "/baz".into(),
    };
    assert_eq!(
        tables.expand_remote(&wire, Some(PeerId(1))).unwrap(),
        "foo/bar/baz"
    );
    assert_eq!(
        tables.expand_remote(&wire, Some(PeerId(2))).unwrap(),
        "quu/x/baz"
    );
    // A third peer never declared RID 7.
    assert!(tables.expand_remote(&wire, Some(PeerId(3))).is_err());

    tables.drop_peer(PeerId(1));
    assert!(tables.expand_remote(&wire, Some(PeerId(1))).is_err());
}

#[test]
fn local_rids_are_monotone() {
    let mut tables = ResourceTables::default();
    let a = tables.next_rid();
    let b = tables.next_rid();
    assert!(b > a);
    assert!(a >= 1, "rid 0 means `no prefix` on the wire");
}
