//! Instance tree and class registry tests

#[cfg(test)]
mod tests {
    use instance_world::{
        registry::{ClassRegistry, InstanceBlueprint, BASE_CLASS, PART_CLASS, WORKSPACE_CLASS},
        InstanceRef, NodeKind, PartData, RegistryError, TreeError, Vec3,
    };
    use std::sync::Arc;

    fn registry() -> ClassRegistry {
        ClassRegistry::with_builtin_classes()
    }

    fn node(registry: &ClassRegistry, name: &str) -> InstanceRef {
        registry.create_named(BASE_CLASS, name).expect("base class is registered")
    }

    fn names(nodes: &[InstanceRef]) -> Vec<String> {
        nodes.iter().map(|n| n.name()).collect()
    }

    // -----------------------------------------------------------------------
    // Registry
    // -----------------------------------------------------------------------

    #[test]
    fn create_backfills_name_and_class() {
        let reg = registry();
        let part = reg.create(PART_CLASS).unwrap();

        assert_eq!(part.class_name(), "Part");
        assert_eq!(part.name(), "Part");
        assert!(part.parent().is_none());
        assert!(part.get_children().is_empty());
        assert_eq!(part.part(), Some(PartData::default()));
    }

    #[test]
    fn blueprint_name_is_kept_and_empty_name_is_replaced() {
        let reg = ClassRegistry::new();
        reg.register("Lamp", || Some(InstanceBlueprint::generic().named("Desk lamp")))
            .unwrap();
        reg.register("Blank", || Some(InstanceBlueprint::generic().named("")))
            .unwrap();

        assert_eq!(reg.create("Lamp").unwrap().name(), "Desk lamp");
        assert_eq!(reg.create("Blank").unwrap().name(), "Blank");
    }

    #[test]
    fn unknown_class_and_failing_constructor_yield_none() {
        let reg = ClassRegistry::new();
        reg.register("Broken", || None).unwrap();

        assert!(reg.create("Nope").is_none());
        assert!(reg.create("Broken").is_none());
    }

    #[test]
    fn empty_class_name_is_rejected() {
        let reg = ClassRegistry::new();
        assert_eq!(
            reg.register("", || Some(InstanceBlueprint::generic())),
            Err(RegistryError::EmptyClassName)
        );
    }

    #[test]
    fn re_registering_overwrites() {
        let reg = ClassRegistry::new();
        reg.register("Thing", || Some(InstanceBlueprint::generic().named("first")))
            .unwrap();
        reg.register("Thing", || Some(InstanceBlueprint::generic().named("second")))
            .unwrap();

        assert_eq!(reg.create("Thing").unwrap().name(), "second");
        assert_eq!(reg.list_registered(), vec!["Instance", "Thing"]);
    }

    #[test]
    fn identifiers_are_unique() {
        let reg = registry();
        let a = reg.create(PART_CLASS).unwrap();
        let b = reg.create(PART_CLASS).unwrap();
        assert_ne!(a.id(), b.id());
    }

    // -----------------------------------------------------------------------
    // Parenting
    // -----------------------------------------------------------------------

    #[test]
    fn set_parent_moves_between_lists() {
        let reg = registry();
        let a = node(&reg, "A");
        let b = node(&reg, "B");
        let child = node(&reg, "C");

        child.set_parent(Some(&a)).unwrap();
        assert!(Arc::ptr_eq(&child.parent().unwrap(), &a));
        assert_eq!(names(&a.get_children()), vec!["C"]);

        child.set_parent(Some(&b)).unwrap();
        assert!(a.get_children().is_empty());
        assert_eq!(names(&b.get_children()), vec!["C"]);

        child.set_parent(None).unwrap();
        assert!(child.parent().is_none());
        assert!(b.get_children().is_empty());
    }

    #[test]
    fn re_setting_same_parent_keeps_order() {
        let reg = registry();
        let parent = node(&reg, "P");
        let first = node(&reg, "first");
        let second = node(&reg, "second");
        first.set_parent(Some(&parent)).unwrap();
        second.set_parent(Some(&parent)).unwrap();

        first.set_parent(Some(&parent)).unwrap();

        assert_eq!(names(&parent.get_children()), vec!["first", "second"]);
    }

    #[test]
    fn cycles_are_rejected() {
        let reg = registry();
        let a = node(&reg, "A");
        let b = node(&reg, "B");
        b.set_parent(Some(&a)).unwrap();

        assert_eq!(
            a.set_parent(Some(&b)),
            Err(TreeError::WouldCycle {
                child: a.id(),
                parent: b.id()
            })
        );
        assert!(matches!(a.set_parent(Some(&a)), Err(TreeError::WouldCycle { .. })));
        assert!(a.parent().is_none());
    }

    #[test]
    fn moves_across_threads_never_lose_a_child() {
        let reg = registry();
        let left = node(&reg, "left");
        let right = node(&reg, "right");
        let child = node(&reg, "child");
        child.set_parent(Some(&left)).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let (left, right, child) = (left.clone(), right.clone(), child.clone());
                std::thread::spawn(move || {
                    for n in 0..200 {
                        let target = if (i + n) % 2 == 0 { &left } else { &right };
                        child.set_parent(Some(target)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let total = left.get_children().len() + right.get_children().len();
        assert_eq!(total, 1);
    }

    #[test]
    fn opposite_moves_never_form_a_cycle() {
        let reg = registry();
        for _ in 0..500 {
            let a = node(&reg, "a");
            let b = node(&reg, "b");
            let barrier = Arc::new(std::sync::Barrier::new(2));

            let spawn_move = |child: InstanceRef, parent: InstanceRef| {
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    child.set_parent(Some(&parent))
                })
            };
            let a_under_b = spawn_move(a.clone(), b.clone());
            let b_under_a = spawn_move(b.clone(), a.clone());
            let results = [a_under_b.join().unwrap(), b_under_a.join().unwrap()];

            assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
            assert!(results
                .iter()
                .any(|r| matches!(r, Err(TreeError::WouldCycle { .. }))));
            let a_in_b = a.parent().is_some_and(|p| Arc::ptr_eq(&p, &b));
            let b_in_a = b.parent().is_some_and(|p| Arc::ptr_eq(&p, &a));
            assert!(a_in_b != b_in_a);
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    #[test]
    fn descendants_are_pre_order() {
        let reg = registry();
        let root = node(&reg, "root");
        let a = node(&reg, "a");
        let a1 = node(&reg, "a1");
        let b = node(&reg, "b");
        a.set_parent(Some(&root)).unwrap();
        a1.set_parent(Some(&a)).unwrap();
        b.set_parent(Some(&root)).unwrap();

        assert_eq!(names(&root.get_descendants()), vec!["a", "a1", "b"]);
        assert_eq!(a1.get_full_name(), "root.a.a1");
        assert_eq!(root.get_full_name(), "root");
    }

    #[test]
    fn find_first_child_by_name_and_class() {
        let reg = registry();
        let root = node(&reg, "root");
        let ws = reg.create(WORKSPACE_CLASS).unwrap();
        let dup1 = node(&reg, "dup");
        let dup2 = node(&reg, "dup");
        for n in [&dup1, &ws, &dup2] {
            n.set_parent(Some(&root)).unwrap();
        }

        assert!(Arc::ptr_eq(&root.find_first_child("dup").unwrap(), &dup1));
        assert!(Arc::ptr_eq(
            &root.find_first_child_of_class(WORKSPACE_CLASS).unwrap(),
            &ws
        ));
        assert!(root.find_first_child("missing").is_none());
    }

    #[test]
    fn get_all_of_type_includes_self() {
        let reg = registry();
        let outer = reg.create(PART_CLASS).unwrap();
        let inner = reg.create(PART_CLASS).unwrap();
        let other = node(&reg, "other");
        inner.set_parent(Some(&outer)).unwrap();
        other.set_parent(Some(&outer)).unwrap();

        let parts = outer.get_all_of_type(PART_CLASS);
        assert_eq!(parts.len(), 2);
        assert!(Arc::ptr_eq(&parts[0], &outer));
    }

    #[test]
    fn renderables_carry_part_state() {
        let reg = registry();
        let root = node(&reg, "root");
        let part = reg.create_named(PART_CLASS, "Brick").unwrap();
        part.edit_part(|p| {
            p.position = Vec3::new(1.0, 2.0, 3.0);
            p.rotation = Vec3::new(0.0, 90.0, 0.0);
            p.primitive = "LightCube".into();
        });
        part.set_parent(Some(&root)).unwrap();

        let items = root.get_renderables();
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.name, "Brick");
        assert_eq!(item.position, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(item.primitive, "LightCube");
        // 90 degrees about +Y
        let half = std::f32::consts::FRAC_PI_4;
        assert!((item.rotation.y - half.sin()).abs() < 1e-5);
        assert!((item.rotation.w - half.cos()).abs() < 1e-5);
    }

    #[test]
    fn renderables_follow_class_tag() {
        let reg = registry();
        reg.register("Decal", || {
            Some(InstanceBlueprint::new(NodeKind::Part(PartData::default())))
        })
        .unwrap();
        let root = node(&reg, "root");
        let decal = reg.create("Decal").unwrap();
        let part = reg.create_named(PART_CLASS, "Brick").unwrap();
        decal.set_parent(Some(&root)).unwrap();
        part.set_parent(Some(&root)).unwrap();

        assert!(!decal.is_renderable());
        assert!(part.is_renderable());
        assert_eq!(
            root.get_renderables().iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
            vec!["Brick"]
        );

        // A `Part` class with a plain payload still draws, with default geometry.
        let plain = ClassRegistry::new();
        plain
            .register(PART_CLASS, || Some(InstanceBlueprint::generic()))
            .unwrap();
        let bare = plain.create(PART_CLASS).unwrap();
        let items = bare.get_renderables();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].size, PartData::default().size);
        assert_eq!(items[0].primitive, "Cube");
    }

    #[test]
    fn payload_accessors_respect_kind() {
        let reg = registry();
        let ws = reg.create(WORKSPACE_CLASS).unwrap();
        let plain = node(&reg, "plain");

        assert!(ws.set_meta("lobby"));
        assert_eq!(ws.meta().as_deref(), Some("lobby"));
        assert!(!plain.set_meta("x"));
        assert!(!plain.edit_part(|p| p.size = Vec3::zero()));
        assert_eq!(plain.kind(), NodeKind::Generic);
        assert!(!ws.is_renderable());
    }

    // -----------------------------------------------------------------------
    // Destroy
    // -----------------------------------------------------------------------

    #[test]
    fn destroy_detaches_whole_subtree() {
        let reg = registry();
        let root = node(&reg, "root");
        let a = node(&reg, "a");
        let a1 = node(&reg, "a1");
        a.set_parent(Some(&root)).unwrap();
        a1.set_parent(Some(&a)).unwrap();

        a.destroy();

        assert!(root.get_children().is_empty());
        assert!(a.is_destroyed());
        assert!(a1.is_destroyed());
        assert!(a1.parent().is_none());
        assert!(a.get_children().is_empty());

        // Idempotent
        a.destroy();
        assert!(a.is_destroyed());
    }

    #[test]
    fn destroyed_instances_refuse_parenting() {
        let reg = registry();
        let live = node(&reg, "live");
        let dead = node(&reg, "dead");
        dead.destroy();

        assert_eq!(
            live.set_parent(Some(&dead)),
            Err(TreeError::Destroyed { id: dead.id() })
        );
        assert_eq!(
            dead.set_parent(Some(&live)),
            Err(TreeError::Destroyed { id: dead.id() })
        );
    }

    // -----------------------------------------------------------------------
    // Clone
    // -----------------------------------------------------------------------

    #[test]
    fn clone_is_isomorphic_with_fresh_ids() {
        let reg = registry();
        let root = node(&reg, "root");
        let part = reg.create_named(PART_CLASS, "Brick").unwrap();
        part.edit_part(|p| p.size = Vec3::new(2.0, 2.0, 2.0));
        let leaf = node(&reg, "leaf");
        part.set_parent(Some(&root)).unwrap();
        leaf.set_parent(Some(&part)).unwrap();

        let copy = root.clone_tree(Some(&reg));

        assert!(copy.parent().is_none());
        assert_eq!(copy.hierarchy_string(0), root.hierarchy_string(0));

        let originals: Vec<_> = std::iter::once(root.clone()).chain(root.get_descendants()).collect();
        let copies: Vec<_> = std::iter::once(copy.clone()).chain(copy.get_descendants()).collect();
        assert_eq!(originals.len(), copies.len());
        for (o, c) in originals.iter().zip(&copies) {
            assert_ne!(o.id(), c.id());
            assert_eq!(o.class_name(), c.class_name());
            assert_eq!(o.name(), c.name());
        }
        assert_eq!(copies[1].part().unwrap().size, Vec3::new(2.0, 2.0, 2.0));

        // The source tree is untouched.
        assert_eq!(names(&root.get_descendants()), vec!["Brick", "leaf"]);
    }

    #[test]
    fn clone_without_registry_is_class_erased() {
        let reg = registry();
        let part = reg.create_named(PART_CLASS, "Brick").unwrap();

        let copy = part.clone_tree(None);

        assert_eq!(copy.class_name(), PART_CLASS);
        assert_eq!(copy.name(), "Brick");
        assert_eq!(copy.kind(), NodeKind::Generic);
    }
}
