// End-to-end fixture tests: a small flattened function exercising the
// whole pipeline, from CFG ingestion through classification, symbolic
// resolution, and patch synthesis.

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::classify::Strategy;
    use crate::simulation::Simulation;
    use crate::{parser, Address, Config, PatchKind, PatchRecord};

    /// A flattened function with one seed block, a three-level
    /// dispatcher chain, and four real cases:
    ///
    /// - state A does work and restages state B,
    /// - state B selects between states C and D through a CSEL,
    /// - state C is a lone double-width state write,
    /// - state D (the chain fall-through) exits.
    fn fixture_json() -> String {
        r#"{
            "function": "sub_1000",
            "cfg": [
                {
                    "start_address": "0x1000",
                    "links": ["0x1020"],
                    "instructions": [
                        {"address": "0x1000", "mnemonic": "MOV",  "operands": "W9, #0x2222",           "machine_code": "00000000"},
                        {"address": "0x1004", "mnemonic": "MOVK", "operands": "W9, #0x1111,LSL#16",    "machine_code": "00000000"},
                        {"address": "0x1008", "mnemonic": "MOV",  "operands": "W10, #0x4444",          "machine_code": "00000000"},
                        {"address": "0x100c", "mnemonic": "MOVK", "operands": "W10, #0x3333,LSL#16",   "machine_code": "00000000"},
                        {"address": "0x1010", "mnemonic": "MOV",  "operands": "W11, #0x6666",          "machine_code": "00000000"},
                        {"address": "0x1014", "mnemonic": "MOVK", "operands": "W11, #0x5555,LSL#16",   "machine_code": "00000000"},
                        {"address": "0x1018", "mnemonic": "MOV",  "operands": "W8, #0x2222",           "machine_code": "00000000"},
                        {"address": "0x101c", "mnemonic": "MOVK", "operands": "W8, #0x1111,LSL#16",    "machine_code": "00000000"}
                    ]
                },
                {
                    "start_address": "0x1020",
                    "links": ["0x1040", "0x1028"],
                    "instructions": [
                        {"address": "0x1020", "mnemonic": "CMP",  "operands": "W8, W9",   "machine_code": "00000000"},
                        {"address": "0x1024", "mnemonic": "B.EQ", "operands": "loc_1040", "machine_code": "00000000"}
                    ]
                },
                {
                    "start_address": "0x1028",
                    "links": ["0x1060", "0x1030"],
                    "instructions": [
                        {"address": "0x1028", "mnemonic": "CMP",  "operands": "W8, W10",  "machine_code": "00000000"},
                        {"address": "0x102c", "mnemonic": "B.EQ", "operands": "loc_1060", "machine_code": "00000000"}
                    ]
                },
                {
                    "start_address": "0x1030",
                    "links": ["0x1090", "0x1038"],
                    "instructions": [
                        {"address": "0x1030", "mnemonic": "CMP",  "operands": "W8, W11",  "machine_code": "00000000"},
                        {"address": "0x1034", "mnemonic": "B.EQ", "operands": "loc_1090", "machine_code": "00000000"}
                    ]
                },
                {
                    "start_address": "0x1038",
                    "links": ["0x10a0"],
                    "instructions": [
                        {"address": "0x1038", "mnemonic": "B", "operands": "loc_10A0", "machine_code": "00000000"}
                    ]
                },
                {
                    "start_address": "0x1040",
                    "links": ["0x1020"],
                    "instructions": [
                        {"address": "0x1040", "mnemonic": "ADD",  "operands": "W0, W0, #0x1",        "machine_code": "00000000"},
                        {"address": "0x1044", "mnemonic": "MOV",  "operands": "W8, #0x4444",         "machine_code": "00000000"},
                        {"address": "0x1048", "mnemonic": "MOVK", "operands": "W8, #0x3333,LSL#16",  "machine_code": "00000000"},
                        {"address": "0x104c", "mnemonic": "B",    "operands": "loc_1020",            "machine_code": "00000000"}
                    ]
                },
                {
                    "start_address": "0x1060",
                    "links": ["0x1020"],
                    "instructions": [
                        {"address": "0x1060", "mnemonic": "MOV",  "operands": "W12, #0x8888",         "machine_code": "00000000"},
                        {"address": "0x1064", "mnemonic": "MOVK", "operands": "W12, #0x7777,LSL#16",  "machine_code": "00000000"},
                        {"address": "0x1068", "mnemonic": "CMP",  "operands": "W0, W19",              "machine_code": "00000000"},
                        {"address": "0x106c", "mnemonic": "CSEL", "operands": "W8, W11, W12, EQ",     "machine_code": "00000000"},
                        {"address": "0x1070", "mnemonic": "B",    "operands": "loc_1020",             "machine_code": "00000000"}
                    ]
                },
                {
                    "start_address": "0x1090",
                    "links": ["0x1020"],
                    "instructions": [
                        {"address": "0x1090", "mnemonic": "MOV", "operands": "W8, #0x77778888", "machine_code": "0000000000000000"}
                    ]
                },
                {
                    "start_address": "0x10a0",
                    "links": [],
                    "instructions": [
                        {"address": "0x10a0", "mnemonic": "MOV", "operands": "W0, #0",  "machine_code": "00000000"},
                        {"address": "0x10a4", "mnemonic": "RET", "operands": "",        "machine_code": "00000000"}
                    ]
                }
            ]
        }"#
        .to_string()
    }

    fn run_fixture(strategy: Strategy) -> Vec<PatchRecord> {
        let function = parser::load_function(&fixture_json()).unwrap();
        crate::deflatten(function, strategy, Config::default()).unwrap()
    }

    fn by_address(patches: &[PatchRecord]) -> HashMap<Address, &PatchRecord> {
        patches.iter().map(|p| (p.address, p)).collect()
    }

    #[test]
    fn test_real_graph_resolution() {
        let function = parser::load_function(&fixture_json()).unwrap();
        let mut sim = Simulation::new(function, Strategy::Smart.build(Config::default()));
        sim.run().unwrap();
        let ctx = sim.context();

        assert_eq!(ctx.dispatchers, vec![0x1020, 0x1028, 0x1030]);
        let mut reals = ctx.reals.clone();
        reals.sort_unstable();
        assert_eq!(reals, vec![0x1000, 0x1038, 0x1040, 0x1060, 0x1090, 0x10a0]);

        // Seed -> A -> B -> {C, fall-through} -> exit.
        assert_eq!(ctx.function.block(0x1000).unwrap().real_children(), &[0x1040]);
        assert_eq!(ctx.function.block(0x1040).unwrap().real_children(), &[0x1060]);
        assert_eq!(
            ctx.function.block(0x1060).unwrap().real_children(),
            &[0x1090, 0x1038]
        );
        assert_eq!(ctx.function.block(0x1090).unwrap().real_children(), &[0x1038]);
        assert_eq!(ctx.function.block(0x1038).unwrap().real_children(), &[0x10a0]);
        assert!(ctx.function.block(0x10a0).unwrap().real_children().is_empty());
    }

    #[test]
    fn test_end_to_end_patch_list() {
        let patches = run_fixture(Strategy::Smart);
        let index = by_address(&patches);

        // Dispatcher instructions all become NOPs.
        for addr in [0x1020u64, 0x1024, 0x1028, 0x102c, 0x1030, 0x1034] {
            assert_eq!(index[&addr].kind, PatchKind::Nop, "at {addr:#x}");
        }

        // The seed's trailing state write becomes the entry branch.
        assert_eq!(index[&0x101c].kind, PatchKind::Replace);
        assert_eq!(index[&0x101c].mnemonic, "B");
        assert_eq!(index[&0x101c].operands, "0x1040");

        // Case A's dispatcher jump is retargeted at case B.
        assert_eq!(index[&0x104c].mnemonic, "B");
        assert_eq!(index[&0x104c].operands, "0x1060");

        // The select becomes a branch pair.
        assert_eq!(index[&0x106c].mnemonic, "B.EQ");
        assert_eq!(index[&0x106c].operands, "0x1090");
        assert_eq!(index[&0x1070].mnemonic, "B");
        assert_eq!(index[&0x1070].operands, "0x1038");

        // The lone double-width state write is patched in place, with a
        // pad NOP for its upper half.
        assert_eq!(index[&0x1090].mnemonic, "B");
        assert_eq!(index[&0x1090].operands, "0x1038");
        assert_eq!(index[&0x1094].kind, PatchKind::Nop);

        assert_eq!(patches.len(), 12);
    }

    #[test]
    fn test_legacy_strategy_agrees_on_fixture() {
        assert_eq!(run_fixture(Strategy::Smart), run_fixture(Strategy::Legacy));
    }

    #[test]
    fn test_runs_are_deterministic() {
        assert_eq!(run_fixture(Strategy::Smart), run_fixture(Strategy::Smart));
    }

    #[test]
    fn test_no_address_is_emitted_twice() {
        let patches = run_fixture(Strategy::Smart);
        let mut addresses: Vec<Address> = patches.iter().map(|p| p.address).collect();
        addresses.sort_unstable();
        addresses.dedup();
        assert_eq!(addresses.len(), patches.len());
    }

    #[test]
    fn test_dispatcher_instructions_are_fully_covered() {
        // No-op completeness: every instruction of every dispatcher block
        // appears in the patch list.
        let function = parser::load_function(&fixture_json()).unwrap();
        let mut sim = Simulation::new(function, Strategy::Smart.build(Config::default()));
        let patches = sim.run().unwrap();
        let index = by_address(&patches);

        for dispatcher in sim.context().dispatchers.clone() {
            let block = sim.context().function.block(dispatcher).unwrap();
            for ins in &block.instructions {
                assert!(
                    index.contains_key(&ins.address),
                    "dispatcher instruction {:#x} missing from the patch list",
                    ins.address
                );
            }
        }
    }

    #[test]
    fn test_branch_patches_target_resolved_children() {
        let function = parser::load_function(&fixture_json()).unwrap();
        let mut sim = Simulation::new(function, Strategy::Smart.build(Config::default()));
        let patches = sim.run().unwrap();

        for patch in patches.iter().filter(|p| p.kind == PatchKind::Replace) {
            if !patch.mnemonic.starts_with('B') {
                continue;
            }
            let target = parser::parse_address(&patch.operands).unwrap();
            let owner = sim
                .context()
                .function
                .blocks()
                .find(|b| {
                    b.instructions
                        .iter()
                        .any(|i| i.address == patch.address)
                })
                .expect("patched instruction belongs to a block");
            assert!(
                owner.real_children().contains(&target),
                "branch at {:#x} targets {target:#x}, not a resolved child of {:#x}",
                patch.address,
                owner.start
            );
        }
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("cfg.json");
        std::fs::write(&input, fixture_json()).unwrap();

        let function = parser::read_function(&input).unwrap();
        let patches = crate::deflatten(function, Strategy::Smart, Config::default()).unwrap();

        let output = dir.path().join("fix.json");
        let rendered = crate::format::OutputFormat::Json
            .get_formatter()
            .format(&patches)
            .unwrap();
        std::fs::write(&output, rendered).unwrap();

        let parsed: Vec<serde_json::Value> =
            serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
        assert_eq!(parsed.len(), patches.len());
    }

    #[test]
    fn test_single_dispatcher_mode_still_resolves_single_region() {
        let function = parser::load_function(&fixture_json()).unwrap();
        let patches = crate::deflatten(
            function,
            Strategy::Smart,
            Config {
                single_dispatcher: true,
            },
        )
        .unwrap();
        assert_eq!(patches.len(), 12);
    }
}
