use proptest::prelude::*;
use vpat_core::document::{DocumentTree, EntityId, EntityKind, NodeData, NodeTag, attr};
use vpat_engine::commands::{
    AddEntity, AddGroup, AddItemToGroup, ChangeGroupVisibility, Command, DeleteEntity,
    DeleteGroup, GroupRequest, Macro, MoveEntity, OperationRequest, RemoveItemFromGroup,
    RenameEntity, SetAttribute, build_operation,
};
use vpat_engine::context::PatternContext;
use vpat_engine::groups::SourceItem;
use vpat_engine::session::Session;
use vpat_engine::stack::Outcome;
use vpat_engine::store::Measurements;
use vpat_engine::tools::ToolKind;

#[derive(Debug, Clone)]
enum Op {
    AddPoint(i32),
    Rename(usize, String),
    SetX(usize, Option<usize>),
    Delete(usize),
    Move(usize, Option<usize>),
    AddGroup(Vec<usize>),
    DeleteGroup(usize),
    ToggleMember(usize, usize),
    Visibility(usize, bool),
    Operation {
        tool: usize,
        source: usize,
        anchors: (usize, usize),
        grouped: bool,
    },
    AddThenDelete(i32, usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (-50i32..50).prop_map(Op::AddPoint),
        (0usize..8, "[A-Z][a-z]{0,3}").prop_map(|(index, name)| Op::Rename(index, name)),
        (0usize..8, proptest::option::of(0usize..8)).prop_map(|(index, source)| Op::SetX(index, source)),
        (0usize..8).prop_map(Op::Delete),
        (0usize..8, proptest::option::of(0usize..8)).prop_map(|(index, after)| Op::Move(index, after)),
        proptest::collection::vec(0usize..8, 0..4).prop_map(Op::AddGroup),
        (0usize..4).prop_map(Op::DeleteGroup),
        (0usize..4, 0usize..8).prop_map(|(group, member)| Op::ToggleMember(group, member)),
        (0usize..4, any::<bool>()).prop_map(|(group, visible)| Op::Visibility(group, visible)),
        (0usize..4, 0usize..8, (0usize..8, 0usize..8), any::<bool>()).prop_map(
            |(tool, source, anchors, grouped)| Op::Operation {
                tool,
                source,
                anchors,
                grouped,
            }
        ),
        (-50i32..50, 0usize..8).prop_map(|(x, index)| Op::AddThenDelete(x, index)),
    ]
}

fn seeded() -> Session {
    let mut calculation = NodeData::new(NodeTag::Calculation);
    for (id, x) in [(1u64, "0"), (2, "@1.x + 10"), (3, "#waist")] {
        calculation = calculation.with_child(
            NodeData::new(NodeTag::Point)
                .with_id(EntityId::new(id))
                .with_attr("x", x)
                .with_attr("y", "0"),
        );
    }
    let groups = NodeData::new(NodeTag::Groups).with_child(
        NodeData::new(NodeTag::Group)
            .with_id(EntityId::new(4))
            .with_attr(attr::NAME, "Seed")
            .with_child(NodeData::new(NodeTag::Item).with_attr(attr::OBJECT, "1")),
    );
    let data = NodeData::new(NodeTag::Pattern)
        .with_child(NodeData::new(NodeTag::Block).with_child(calculation))
        .with_child(groups);
    let ctx = PatternContext::load(
        DocumentTree::from_data(data),
        Measurements::from([("waist".to_string(), 40.0)]),
    )
    .expect("种子文档加载失败");
    Session::new(ctx, 0)
}

fn pick<T: Copy>(items: &[T], index: usize) -> Option<T> {
    (!items.is_empty()).then(|| items[index % items.len()])
}

fn build(session: &mut Session, op: &Op) -> Option<Command> {
    let points = session.context().records().ids();
    let groups: Vec<EntityId> = session.context().groups().groups().iter().map(|g| g.id).collect();
    let ctx = session.context_mut();
    let command: Command = match op {
        Op::AddPoint(x) => {
            AddEntity::new(ctx, EntityKind::Point, [("x", x.to_string()), ("y", "1".to_string())]).into()
        }
        Op::Rename(index, name) => RenameEntity::new(ctx, pick(&points, *index)?, name.clone()).into(),
        Op::SetX(index, source) => {
            let formula = match source.and_then(|source| pick(&points, source)) {
                Some(source) => format!("@{source}.x + 1"),
                None => "3".to_string(),
            };
            SetAttribute::new(ctx, pick(&points, *index)?, "x", formula).into()
        }
        Op::Delete(index) => DeleteEntity::new(ctx, pick(&points, *index)?).into(),
        Op::Move(index, after) => {
            let after = after.and_then(|after| pick(&points, after));
            MoveEntity::new(ctx, pick(&points, *index)?, after).into()
        }
        Op::AddGroup(members) => {
            let mut items: Vec<SourceItem> = Vec::new();
            for member in members {
                let Some(id) = pick(&points, *member) else { continue };
                if items.iter().all(|item| item.id != id) {
                    items.push(SourceItem::new(id));
                }
            }
            AddGroup::new(ctx, "G", Vec::new(), items).into()
        }
        Op::DeleteGroup(index) => DeleteGroup::new(pick(&groups, *index)?).into(),
        Op::ToggleMember(group, member) => {
            let group = pick(&groups, *group)?;
            let member = pick(&points, *member)?;
            let present = ctx.groups().get(group).is_some_and(|g| g.contains(member));
            if present {
                RemoveItemFromGroup::new(group, member).into()
            } else {
                AddItemToGroup::new(group, SourceItem::new(member)).into()
            }
        }
        Op::Visibility(group, visible) => {
            ChangeGroupVisibility::new(pick(&groups, *group)?, *visible).into()
        }
        Op::Operation {
            tool,
            source,
            anchors,
            grouped,
        } => {
            let plain: Vec<EntityId> = points
                .iter()
                .copied()
                .filter(|id| ctx.entity_kind(*id) == Some(EntityKind::Point))
                .collect();
            let tool = ToolKind::ALL[*tool % ToolKind::ALL.len()];
            let mut request = OperationRequest::new(tool);
            request.sources.push(SourceItem::new(pick(&plain, *source)?));
            request.anchors = [anchors.0, anchors.1]
                .iter()
                .take(tool.anchor_count())
                .map(|index| pick(&plain, *index))
                .collect::<Option<Vec<_>>>()?;
            request.parameters.insert("angle".to_string(), "45".to_string());
            if *grouped {
                request.group = Some(GroupRequest {
                    name: "Results".to_string(),
                    tags: Vec::new(),
                });
            }
            build_operation(ctx, &request)
        }
        Op::AddThenDelete(x, index) => {
            let target = pick(&points, *index)?;
            let add = AddEntity::new(ctx, EntityKind::Point, [("x", x.to_string()), ("y", "2".to_string())]);
            let delete = DeleteEntity::new(ctx, target);
            Macro::new("add then delete", vec![add.into(), delete.into()]).into()
        }
    };
    Some(command)
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 96, .. ProptestConfig::default() })]

    #[test]
    fn n_commands_then_n_undos_restore_every_representation(ops in proptest::collection::vec(op_strategy(), 1..24)) {
        let mut session = seeded();
        let initial = session.context().snapshot();

        let mut applied = 0usize;
        for op in &ops {
            let Some(command) = build(&mut session, op) else { continue };
            match session.push(command).expect("不应出现重入") {
                Outcome::Applied => applied += 1,
                Outcome::Aborted(_) => {}
                other => prop_assert!(false, "unexpected outcome {:?} for {:?}", other, op),
            }
        }
        prop_assert_eq!(session.stack().index(), applied);

        for _ in 0..applied {
            prop_assert_eq!(session.undo().expect("不应出现重入"), Outcome::Applied);
        }
        prop_assert_eq!(session.context().snapshot(), initial);
    }

    #[test]
    fn redo_after_full_undo_reaches_the_same_state(ops in proptest::collection::vec(op_strategy(), 1..16)) {
        let mut session = seeded();
        for op in &ops {
            if let Some(command) = build(&mut session, op) {
                session.push(command).expect("不应出现重入");
            }
        }
        let after = session.context().snapshot();
        while session.stack().can_undo() {
            session.undo().expect("不应出现重入");
        }
        while session.stack().can_redo() {
            prop_assert_eq!(session.redo().expect("不应出现重入"), Outcome::Applied);
        }
        prop_assert_eq!(session.context().snapshot(), after);
    }
}
