//! End-to-end access-control tests through the public API.
//!
//! # Tiers
//!
//! - **Tier 0:** Resolution properties against an in-memory catalog
//! - **Tier 1:** The same catalog backed by SQLite, reloaded from disk
//! - **Tier 2:** Admin flows: JSON edits, explanations, effective props

use ferri_core::{
    AccountStore, AclError, Catalog, Edit, EditOutcome, FerriDb, ResolverOptions, RuleSource,
    Snapshot, TreeStore, VfsError,
};
use ferri_types::{Account, AccountId, MaskProps, NodeId, Operation, VfsNode, WhoCan};

// ============================================================================
// Shared test setup
// ============================================================================

/// Tree:
///
/// ```text
/// /            (root for files.example.com and *.example.com)
/// └── public
///     └── share        (disk: /srv/share)
///         ├── report.pdf
///         └── notes.txt
/// ```
struct Site {
    catalog: Catalog,
    root: NodeId,
    public: NodeId,
    share: NodeId,
    report: NodeId,
    notes: NodeId,
    amy: AccountId,
    bob: AccountId,
    staff: AccountId,
    everyone: AccountId,
}

fn site_with(catalog: Catalog) -> Site {
    let amy = Account::user("amy");
    let bob = Account::user("bob");
    let staff = Account::group("staff");
    let everyone = Account::group("everyone");

    let root = VfsNode::root("");
    let public = VfsNode::named(root.id, "public");
    let share = VfsNode::disk(public.id, "/srv/share");
    let report = VfsNode::disk(share.id, "/srv/share/report.pdf");
    let notes = VfsNode::disk(share.id, "/srv/share/notes.txt");

    let site = Site {
        root: root.id,
        public: public.id,
        share: share.id,
        report: report.id,
        notes: notes.id,
        amy: amy.id,
        bob: bob.id,
        staff: staff.id,
        everyone: everyone.id,
        catalog,
    };

    site.catalog
        .apply_all(&[
            Edit::InsertAccount { account: amy },
            Edit::InsertAccount { account: bob },
            Edit::InsertAccount { account: staff },
            Edit::InsertAccount { account: everyone },
            Edit::AddMembership { account: site.amy, group: site.staff },
            Edit::AddMembership { account: site.staff, group: site.everyone },
            Edit::InsertNode { node: root },
            Edit::InsertNode { node: public },
            Edit::InsertNode { node: share },
            Edit::InsertNode { node: report },
            Edit::InsertNode { node: notes },
            Edit::AddRoot { host: "files.example.com".into(), node: site.root },
            Edit::AddRoot { host: "*.example.com".into(), node: site.public },
        ])
        .expect("seed edits apply");
    site
}

fn site() -> Site {
    site_with(Catalog::new(Snapshot::default(), ResolverOptions::default()))
}

fn set(site: &Site, node: NodeId, operation: Operation, who: WhoCan) {
    site.catalog
        .apply(&Edit::SetPermission { node, operation, who })
        .expect("set permission");
}

fn mask(site: &Site, node: NodeId, pattern: &str, props: MaskProps, ord: i64) -> i64 {
    match site.catalog.apply(&Edit::AddMask {
        node,
        pattern: pattern.into(),
        props,
        ord,
    }) {
        Ok(EditOutcome::MaskAdded(seq)) => seq,
        other => panic!("unexpected mask outcome: {other:?}"),
    }
}

// ============================================================================
// Tier 0: resolution properties
// ============================================================================

#[test]
fn test_default_deny_everywhere() {
    let s = site();
    for node in [s.root, s.public, s.share, s.report, s.notes] {
        for op in Operation::ALL {
            assert!(!s.catalog.can_do(Some(s.amy), node, op, 0));
            assert!(!s.catalog.can_do(None, node, op, 0));
        }
    }
}

#[test]
fn test_star_grants_anonymous() {
    let s = site();
    set(&s, s.notes, Operation::Read, WhoCan::Anyone);
    assert!(s.catalog.can_do(None, s.notes, Operation::Read, 0));
    assert!(s.catalog.can_do(Some(s.bob), s.notes, Operation::Read, 0));
    assert!(!s.catalog.can_do(None, s.report, Operation::Read, 0));
}

#[test]
fn test_nearest_node_wins() {
    let s = site();
    set(&s, s.public, Operation::Read, WhoCan::Anyone);
    set(&s, s.share, Operation::Read, WhoCan::Fixed(false));
    assert!(!s.catalog.can_do(None, s.share, Operation::Read, 0));
    assert!(!s.catalog.can_do(None, s.report, Operation::Read, 0));
    assert!(s.catalog.can_do(None, s.public, Operation::Read, 0));
}

#[test]
fn test_children_scope_split() {
    let s = site();
    set(
        &s,
        s.public,
        Operation::List,
        WhoCan::scoped(WhoCan::Fixed(false), WhoCan::Fixed(true)),
    );
    assert!(!s.catalog.can_do(None, s.public, Operation::List, 0));
    assert!(s.catalog.can_do(None, s.share, Operation::List, 0));
    assert!(s.catalog.can_do(None, s.report, Operation::List, 0));
}

#[test]
fn test_mask_ord_priority() {
    let s = site();
    mask(
        &s,
        s.share,
        "*.pdf",
        MaskProps::default().with(Operation::Read, WhoCan::Fixed(false)),
        5,
    );
    mask(
        &s,
        s.share,
        "report*",
        MaskProps::default().with(Operation::Read, WhoCan::Fixed(true)),
        10,
    );
    assert!(s.catalog.can_do(None, s.report, Operation::Read, 0));
    assert!(!s.catalog.can_do(None, s.notes, Operation::Read, 0));
}

#[test]
fn test_equal_ord_first_declared_wins() {
    let s = site();
    mask(
        &s,
        s.share,
        "*",
        MaskProps::default().with(Operation::See, WhoCan::Anyone),
        0,
    );
    mask(
        &s,
        s.share,
        "*.txt",
        MaskProps::default().with(Operation::See, WhoCan::Fixed(false)),
        0,
    );
    assert!(s.catalog.can_do(None, s.notes, Operation::See, 0));
}

#[test]
fn test_explicit_permission_outranks_mask() {
    let s = site();
    mask(
        &s,
        s.share,
        "*.pdf",
        MaskProps::default().with(Operation::Read, WhoCan::Anyone),
        0,
    );
    set(&s, s.report, Operation::Read, WhoCan::Fixed(false));
    assert!(!s.catalog.can_do(None, s.report, Operation::Read, 0));
}

#[test]
fn test_delegation_follows_target_operation() {
    let s = site();
    set(&s, s.report, Operation::See, WhoCan::Delegate(Operation::Read));
    set(&s, s.report, Operation::Read, WhoCan::accounts(["staff"]));
    assert!(s.catalog.can_do(Some(s.amy), s.report, Operation::See, 0));
    assert!(!s.catalog.can_do(Some(s.bob), s.report, Operation::See, 0));
}

#[test]
fn test_nested_group_membership() {
    let s = site();
    set(&s, s.share, Operation::Upload, WhoCan::accounts(["everyone"]));
    assert!(s.catalog.can_do(Some(s.amy), s.share, Operation::Upload, 0));
    assert!(!s.catalog.can_do(Some(s.bob), s.share, Operation::Upload, 0));
}

#[test]
fn test_membership_cycle_is_finite() {
    let s = site();
    s.catalog
        .apply(&Edit::AddMembership { account: s.everyone, group: s.staff })
        .unwrap();
    let closure = s.catalog.resolve_groups(s.staff);
    assert_eq!(closure.len(), 2);
    assert!(closure.contains(&s.staff) && closure.contains(&s.everyone));

    set(&s, s.notes, Operation::Read, WhoCan::accounts(["nobody-here"]));
    assert!(!s.catalog.can_do(Some(s.amy), s.notes, Operation::Read, 0));
}

#[test]
fn test_root_resolution() {
    let s = site();
    assert_eq!(s.catalog.resolve_root("files.example.com").unwrap(), s.root);
    assert_eq!(s.catalog.resolve_root("sub.example.com").unwrap(), s.public);
    assert!(matches!(
        s.catalog.resolve_root("example.org"),
        Err(VfsError::NoRoot(_))
    ));

    s.catalog
        .apply(&Edit::AddRoot { host: "sub.example.com".into(), node: s.share })
        .unwrap();
    assert_eq!(s.catalog.resolve_root("sub.example.com").unwrap(), s.share);
}

#[test]
fn test_cascade_delete() {
    let s = site();
    set(&s, s.report, Operation::Read, WhoCan::Anyone);
    mask(&s, s.share, "*", MaskProps::default(), 0);
    s.catalog
        .apply(&Edit::SetRename {
            node: s.share,
            original_name: "notes.txt".into(),
            display_name: "Notes.txt".into(),
        })
        .unwrap();

    let outcome = s.catalog.apply(&Edit::DeleteNode { id: s.share }).unwrap();
    let EditOutcome::NodesDeleted(removed) = outcome else {
        panic!("expected NodesDeleted");
    };
    assert_eq!(removed.len(), 3);

    let snap = s.catalog.snapshot();
    let tree = snap.tree();
    for id in [s.share, s.report, s.notes] {
        assert!(tree.get_node(id).is_none());
        assert!(tree.get_permissions(id).is_empty());
        assert!(tree.get_masks(id).is_empty());
        assert!(tree.get_renames(id).is_empty());
    }
    assert_eq!(tree.children(s.public).unwrap().len(), 0);
}

#[test]
fn test_disabled_account_vetoed() {
    let s = site();
    set(&s, s.notes, Operation::Read, WhoCan::Anyone);
    let mut amy = s.catalog.snapshot().accounts().get_account(s.amy).cloned().unwrap();
    amy.disabled = true;
    s.catalog.apply(&Edit::UpdateAccount { account: amy }).unwrap();

    assert!(!s.catalog.can_do(Some(s.amy), s.notes, Operation::Read, 0));
    assert!(s.catalog.can_do(None, s.notes, Operation::Read, 0));
}

#[test]
fn test_configuration_errors_deny() {
    let s = site();
    // Bypasses write-time validation the way a hand-edited database would.
    let snap = s.catalog.snapshot();
    let mut tree = snap.tree().clone();
    tree.insert_mask_row(ferri_types::NodeMask {
        seq: 999,
        node_id: s.share,
        pattern: "*".into(),
        props: r#"{"can_read": "everybody"}"#.into(),
        ord: 0,
    })
    .unwrap();
    let catalog = Catalog::new(
        Snapshot::new(snap.accounts().clone(), tree),
        ResolverOptions::default(),
    );
    assert!(matches!(
        catalog.check(None, s.notes, Operation::Read, 0),
        Err(AclError::MalformedMask { .. })
    ));
    assert!(!catalog.can_do(None, s.notes, Operation::Read, 0));
}

// ============================================================================
// Tier 1: SQLite-backed catalog
// ============================================================================

#[test]
fn test_sqlite_catalog_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ferri.db");

    let (report, amy) = {
        let catalog =
            Catalog::with_db(FerriDb::open(&path).unwrap(), ResolverOptions::default()).unwrap();
        let s = site_with(catalog);
        set(
            &s,
            s.share,
            Operation::Read,
            WhoCan::scoped(WhoCan::Fixed(false), WhoCan::accounts(["staff"])),
        );
        mask(
            &s,
            s.share,
            "*.txt",
            MaskProps::default().with(Operation::Read, WhoCan::Anyone),
            1,
        );
        (s.report, s.amy)
    };

    let reopened =
        Catalog::with_db(FerriDb::open(&path).unwrap(), ResolverOptions::default()).unwrap();
    assert!(reopened.can_do(Some(amy), report, Operation::Read, 0));
    assert!(!reopened.can_do(None, report, Operation::Read, 0));
    let root = reopened.resolve_root("files.example.com").unwrap();
    let notes = reopened
        .snapshot()
        .tree()
        .resolve_path(root, "public/share/notes.txt")
        .unwrap();
    assert!(reopened.can_do(None, notes, Operation::Read, 0));
}

#[test]
fn test_sqlite_cascade_leaves_no_orphans() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ferri.db");
    let public = {
        let catalog =
            Catalog::with_db(FerriDb::open(&path).unwrap(), ResolverOptions::default()).unwrap();
        let s = site_with(catalog);
        set(&s, s.report, Operation::Read, WhoCan::Anyone);
        mask(&s, s.share, "*", MaskProps::default(), 0);
        s.catalog.apply(&Edit::DeleteNode { id: s.public }).unwrap();
        s.public
    };

    let snap = FerriDb::open(&path).unwrap().load().unwrap();
    assert_eq!(snap.tree().len(), 1);
    assert!(snap.tree().get_node(public).is_none());
    // The glob root pointed into the deleted subtree.
    assert_eq!(snap.tree().get_roots().len(), 1);
}

#[test]
fn test_rejected_edit_is_not_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ferri.db");
    {
        let catalog =
            Catalog::with_db(FerriDb::open(&path).unwrap(), ResolverOptions::default()).unwrap();
        let s = site_with(catalog);
        let err = s
            .catalog
            .apply(&Edit::AddMembership { account: s.staff, group: s.bob })
            .unwrap_err();
        assert!(err.to_string().contains("not a group"), "got: {err}");
    }
    let snap = FerriDb::open(&path).unwrap().load().unwrap();
    let bob = snap.accounts().get_account_by_username("bob").unwrap().id;
    let staff = snap.accounts().get_account_by_username("staff").unwrap().id;
    assert!(!snap.accounts().resolve_groups(staff).contains(&bob));
}

#[test]
fn test_far_expiry_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ferri.db");
    let (root, amy) = {
        let catalog =
            Catalog::with_db(FerriDb::open(&path).unwrap(), ResolverOptions::default()).unwrap();
        let s = site_with(catalog);
        set(&s, s.root, Operation::Read, WhoCan::accounts(["amy"]));

        let mut account = s.catalog.snapshot().accounts().get_account(s.amy).unwrap().clone();
        account.expire = Some(u64::MAX);
        let err = s
            .catalog
            .apply(&Edit::UpdateAccount { account: account.clone() })
            .unwrap_err();
        assert!(err.to_string().contains("storable range"), "got: {err}");

        account.expire = Some(i64::MAX as u64);
        s.catalog.apply(&Edit::UpdateAccount { account }).unwrap();
        assert!(s.catalog.can_do(Some(s.amy), s.root, Operation::Read, 1_700_000_000_000));
        (s.root, s.amy)
    };

    let reopened =
        Catalog::with_db(FerriDb::open(&path).unwrap(), ResolverOptions::default()).unwrap();
    let expire = reopened.snapshot().accounts().get_account(amy).unwrap().expire;
    assert_eq!(expire, Some(i64::MAX as u64));
    assert!(reopened.can_do(Some(amy), root, Operation::Read, 1_700_000_000_000));
}

#[test]
fn test_bad_nested_glob_is_rejected_at_write() {
    let s = site();
    set(&s, s.report, Operation::Read, WhoCan::Anyone);

    let mut props = MaskProps::default();
    props
        .masks
        .insert("[".into(), MaskProps::default().with(Operation::Read, WhoCan::Anyone));
    let err = s
        .catalog
        .apply(&Edit::AddMask { node: s.root, pattern: "public".into(), props, ord: 0 })
        .unwrap_err();
    assert!(err.to_string().contains("invalid glob"), "got: {err}");

    assert!(s.catalog.snapshot().tree().get_masks(s.root).is_empty());
    assert!(s.catalog.can_do(None, s.report, Operation::Read, 0));
}

// ============================================================================
// Tier 2: admin flows
// ============================================================================

#[test]
fn test_json_lines_edits() {
    let s = site();
    let lines = format!(
        "{}\n{}\n",
        format_args!(
            r#"{{"op":"set_permission","node":"{}","operation":"see","who":{{"children":"*"}}}}"#,
            s.share
        ),
        format_args!(
            r#"{{"op":"add_mask","node":"{}","pattern":"*.pdf","props":{{"can_see":false}},"ord":1}}"#,
            s.share
        ),
    );
    let edits: Vec<Edit> = lines
        .lines()
        .map(|l| serde_json::from_str(l).expect("edit parses"))
        .collect();
    s.catalog.apply_all(&edits).unwrap();

    assert!(!s.catalog.can_do(None, s.share, Operation::See, 0));
    assert!(s.catalog.can_do(None, s.notes, Operation::See, 0));
    assert!(!s.catalog.can_do(None, s.report, Operation::See, 0));
}

#[test]
fn test_explain_reports_source() {
    let s = site();
    set(&s, s.public, Operation::Read, WhoCan::scoped(WhoCan::Fixed(false), WhoCan::Anyone));
    let why = s.catalog.explain(None, s.report, Operation::Read, 0).unwrap();
    assert!(why.allowed);
    assert_eq!(why.source, RuleSource::Inherited { from_mask: false });
    assert_eq!(why.node, Some(s.public));

    let json = serde_json::to_value(&why).unwrap();
    assert_eq!(json["source"]["kind"], "inherited");
    assert_eq!(json["operation"], "read");
}

#[test]
fn test_effective_names_and_props() {
    let s = site();
    s.catalog
        .apply(&Edit::SetRename {
            node: s.share,
            original_name: "report.pdf".into(),
            display_name: "Quarterly Report.pdf".into(),
        })
        .unwrap();
    mask(
        &s,
        s.share,
        "*.pdf",
        MaskProps {
            mime: Some("application/pdf".into()),
            ..MaskProps::default()
        },
        0,
    );

    let snap = s.catalog.snapshot();
    assert_eq!(snap.tree().effective_name(s.share).unwrap(), "share");
    assert_eq!(
        snap.tree().effective_name(s.report).unwrap(),
        "Quarterly Report.pdf"
    );
    let names: Vec<String> = snap
        .tree()
        .children(s.share)
        .unwrap()
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert_eq!(names, ["notes.txt", "Quarterly Report.pdf"]);

    // Masks see the displayed name.
    let props = s.catalog.effective_props(s.report).unwrap();
    assert_eq!(props.mime.as_deref(), Some("application/pdf"));
}
