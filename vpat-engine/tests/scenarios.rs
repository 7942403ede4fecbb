use std::cell::RefCell;
use std::rc::Rc;

use vpat_core::document::{EntityId, EntityKind, NodeTag};
use vpat_engine::commands::{
    AddEntity, AddGroup, ChangeGroupVisibility, DeleteEntity, RenameEntity, SetAttribute,
};
use vpat_engine::context::{DEFAULT_BLOCK_NAME, PatternContext};
use vpat_engine::errors::EngineError;
use vpat_engine::events::DocumentEvent;
use vpat_engine::groups::SourceItem;
use vpat_engine::selection::{
    Rejection, SelectionEffect, SelectionInput, SelectionPhase, SelectionStateMachine,
};
use vpat_engine::session::Session;
use vpat_engine::stack::Outcome;
use vpat_engine::tools::ToolKind;

fn session() -> Session {
    Session::new(PatternContext::new(DEFAULT_BLOCK_NAME), 0)
}

fn add_point(session: &mut Session, x: &str) -> EntityId {
    let add = AddEntity::new(session.context_mut(), EntityKind::Point, [("x", x), ("y", "0")]);
    let id = add.id();
    assert_eq!(session.push(add).expect("入栈失败"), Outcome::Applied);
    id
}

fn calculation_order(session: &Session) -> Vec<EntityId> {
    let tree = session.context().tree();
    let block = tree.blocks()[0];
    let calculation = tree
        .child_by_tag(block, NodeTag::Calculation)
        .expect("缺少计算容器");
    tree.children(calculation)
        .iter()
        .filter_map(|key| tree.id_of(*key))
        .collect()
}

#[test]
fn deleting_a_grouped_entity_is_undone_in_place() {
    let mut session = session();
    let a = add_point(&mut session, "0");
    let b = add_point(&mut session, "1");
    let c = add_point(&mut session, "2");
    let group = AddGroup::new(
        session.context_mut(),
        "G1",
        Vec::new(),
        vec![SourceItem::new(a), SourceItem::new(b), SourceItem::new(c)],
    );
    let g1 = group.id();
    session.push(group).unwrap();

    let delete = DeleteEntity::new(session.context(), b);
    assert_eq!(session.push(delete).unwrap(), Outcome::Applied);
    let members: Vec<_> = session.context().groups().get(g1).unwrap().items.iter().map(|item| item.id).collect();
    assert_eq!(members, vec![a, c]);

    assert_eq!(session.undo().unwrap(), Outcome::Applied);
    let members: Vec<_> = session.context().groups().get(g1).unwrap().items.iter().map(|item| item.id).collect();
    assert_eq!(members, vec![a, b, c]);
    assert_eq!(calculation_order(&session), vec![a, b, c]);
}

#[test]
fn delete_undo_redo_keeps_sibling_position_with_interleaved_commands() {
    let mut session = session();
    let a = add_point(&mut session, "0");
    let b = add_point(&mut session, "1");
    let c = add_point(&mut session, "2");
    let d = add_point(&mut session, "3");
    let initial = session.context().snapshot();
    let depth = session.stack().len();

    let rename = RenameEntity::new(session.context(), d, "D");
    session.push(rename).unwrap();
    let delete = DeleteEntity::new(session.context(), b);
    session.push(delete).unwrap();
    let edit = SetAttribute::new(session.context(), c, "y", "5");
    session.push(edit).unwrap();

    session.undo().unwrap();
    session.undo().unwrap();
    assert_eq!(calculation_order(&session), vec![a, b, c, d]);
    session.redo().unwrap();
    assert_eq!(calculation_order(&session), vec![a, c, d]);
    session.redo().unwrap();
    session.undo().unwrap();
    session.undo().unwrap();
    assert_eq!(calculation_order(&session), vec![a, b, c, d]);

    while session.stack().index() > depth {
        session.undo().unwrap();
    }
    assert_eq!(session.context().snapshot(), initial);
}

#[test]
fn pushing_after_undo_discards_exactly_the_undone_commands() {
    let mut session = session();
    for x in ["1", "2", "3", "4"] {
        add_point(&mut session, x);
    }
    session.undo().unwrap();
    session.undo().unwrap();
    assert_eq!(session.stack().len(), 4);
    assert_eq!(session.stack().index(), 2);

    add_point(&mut session, "9");
    assert_eq!(session.stack().len(), 3);
    assert!(!session.stack().can_redo());
    assert_eq!(session.redo().unwrap(), Outcome::Ignored);
}

#[test]
fn toggling_group_visibility_on_and_off_restores_visual_state() {
    let mut session = session();
    let a = add_point(&mut session, "0");
    let b = add_point(&mut session, "1");
    let group = AddGroup::new(session.context_mut(), "G", Vec::new(), vec![SourceItem::new(a)]);
    let g = group.id();
    session.push(group).unwrap();
    let before = session.context().snapshot();

    session.push(ChangeGroupVisibility::new(g, false)).unwrap();
    assert!(!session.context().scene().is_visible(a));
    assert!(session.context().scene().is_visible(b));
    session.push(ChangeGroupVisibility::new(g, true)).unwrap();
    assert!(session.context().scene().is_visible(a));

    assert!(session.context().groups().get(g).unwrap().visible);

    session.undo().unwrap();
    session.undo().unwrap();
    assert_eq!(session.context().snapshot(), before);
}

#[test]
fn hide_all_five_groups_is_undone_in_one_step() {
    let mut session = session();
    let point = add_point(&mut session, "0");
    for index in 0..5 {
        let group = AddGroup::new(
            session.context_mut(),
            format!("G{index}"),
            vec!["all".to_string()],
            vec![SourceItem::new(point)],
        );
        session.push(group).unwrap();
    }

    let notifications = Rc::new(RefCell::new(0usize));
    let sink = Rc::clone(&notifications);
    session.context_mut().events_mut().subscribe(move |event| {
        if matches!(event, DocumentEvent::GroupVisibilityChanged(_)) {
            *sink.borrow_mut() += 1;
        }
    });

    assert_eq!(session.hide_all_groups().unwrap(), Outcome::Applied);
    assert_eq!(*notifications.borrow(), 1);
    assert!(session.context().groups().groups().iter().all(|group| !group.visible));

    assert_eq!(session.undo().unwrap(), Outcome::Applied);
    assert_eq!(*notifications.borrow(), 2);
    assert!(session.context().groups().groups().iter().all(|group| group.visible));
    assert!(session.context().scene().is_visible(point));
}

#[test]
fn anchor_pick_rejects_gathered_sources() {
    let mut session = session();
    let p1 = add_point(&mut session, "1");
    let p2 = add_point(&mut session, "2");
    let p3 = add_point(&mut session, "3");
    let mut machine = SelectionStateMachine::new(ToolKind::Rotation);

    session.select(&mut machine, SelectionInput::Toggle(p1));
    session.select(&mut machine, SelectionInput::Toggle(p2));
    assert_eq!(machine.phase(), SelectionPhase::Gathering);
    session.select(&mut machine, SelectionInput::Confirm);
    assert_eq!(machine.phase(), SelectionPhase::AnchorPick);

    let rejected = session.select(&mut machine, SelectionInput::Pick { id: p1, modifier: false });
    assert_eq!(rejected.effect, SelectionEffect::Rejected(Rejection::AnchorIsSource));
    assert_eq!(machine.phase(), SelectionPhase::AnchorPick);

    let accepted = session.select(&mut machine, SelectionInput::Pick { id: p3, modifier: false });
    assert_eq!(accepted.to, SelectionPhase::Preview);

    session.select(&mut machine, SelectionInput::Cancel);
    assert_eq!(machine.phase(), SelectionPhase::Idle);
    assert_eq!(session.stack().len(), 3);
    assert_eq!(session.context().scene().preview_count(), 0);
}

#[test]
fn stale_target_is_aborted_with_status_message() {
    let mut session = session();
    let a = add_point(&mut session, "0");
    let rename = RenameEntity::new(session.context(), a, "A");
    session.undo().unwrap();

    let messages = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&messages);
    session.context_mut().events_mut().subscribe(move |event| {
        if let DocumentEvent::Status(message) = event {
            sink.borrow_mut().push(message.clone());
        }
    });
    let outcome = session.push(rename).unwrap();
    assert_eq!(outcome, Outcome::Aborted(EngineError::StaleReference(a)));
    assert_eq!(messages.borrow().len(), 1);
    assert!(session.context().tree().find_by_id(a).is_none());
    assert_eq!(session.stack().index(), 0);
}
