use crate::base::behavior::ModuleBehaviors;
use crate::base::mem::HasMemory;
use crate::compute::unit::pack_row;
use crate::compute::{Operands, UnitStatus, DIM};
use crate::fabric::types::{Addr, BusTarget, Word, POISON_WORD};
use crate::unit_tests::harness::*;

const CONTROL: Addr = 0x4000_0000;

fn stage_tile(fabric: &mut crate::sim::top::Fabric, addr: Addr, tile: &[[i8; DIM]; DIM]) {
    let words: Vec<Word> = tile.iter().map(pack_row).collect();
    fabric.poke_words(addr, &words).unwrap();
}

fn identity() -> [[i8; DIM]; DIM] {
    let mut tile = [[0; DIM]; DIM];
    (0..DIM).for_each(|i| tile[i][i] = 1);
    tile
}

/// Rows of `seed..seed + 16`.
fn counting(seed: i8) -> [[i8; DIM]; DIM] {
    let mut tile = [[0; DIM]; DIM];
    for i in 0..DIM * DIM {
        tile[i / DIM][i % DIM] = seed.wrapping_add(i as i8);
    }
    tile
}

#[test]
fn cpu_reads_back_its_own_write() {
    let mut fabric = default_fabric();
    fabric.cpu_mut().push_write(0x100, 0xABCD_0123);
    fabric.cpu_mut().push_read(0x100);
    drain_cpu(&mut fabric);
    let completed = fabric.cpu().completed();
    assert_eq!(2, completed.len());
    assert!(!completed[1].response.error);
    assert_eq!(0xABCD_0123, completed[1].response.data);
    assert_eq!(2, fabric.crossbar().stats().grants_to(CPU));
}

#[test]
fn resident_read_takes_three_cycles() {
    let mut fabric = default_fabric();
    fabric.cpu_mut().push_write(0x80, 5);
    drain_cpu(&mut fabric);
    fabric.cpu_mut().push_read(0x80);
    // grant, lookup, response routed
    assert_eq!(3, drain_cpu(&mut fabric));
    assert_eq!(1, fabric.memory().stats().hits());
}

#[test]
fn dirty_line_is_written_back_on_eviction() {
    let mut fabric = fabric_with(tiny_cache());
    fabric.cpu_mut().push_write(0x04, 0x1111);
    fabric.cpu_mut().push_read(0x104);
    fabric.cpu_mut().push_read(0x04);
    drain_cpu(&mut fabric);

    let completed = fabric.cpu().completed();
    assert_eq!(0x1111, completed[2].response.data);
    let stats = fabric.memory().stats();
    assert_eq!(1, stats.writebacks());
    assert_eq!(0x1111, fabric.memory().backing().mem().read_word(0x04).unwrap());
}

#[test]
fn flush_and_poke_wait_for_an_in_flight_miss() {
    let mut fabric = fabric_with(tiny_cache());
    fabric.cpu_mut().push_write(0x04, 0x1111);
    drain_cpu(&mut fabric);
    fabric.cpu_mut().push_write(0x108, 0x2222);
    fabric.cpu_mut().push_read(0x104);
    // grant, lookup, miss evaluate: the dirty victim of the write miss is on its way out
    tick(&mut fabric, 3);
    assert!(fabric.memory().backing().busy());
    assert!(fabric.flush().is_err());
    assert!(fabric.poke_word(0x100, 9).is_err());

    drain_cpu(&mut fabric);
    let completed = fabric.cpu().completed();
    assert!(completed.iter().all(|c| !c.response.error));
    assert_eq!(0, completed[2].response.data);
    fabric.flush().unwrap();
    assert_eq!(0x1111, fabric.memory().backing().mem().read_word(0x04).unwrap());
    assert_eq!(0x2222, fabric.memory().backing().mem().read_word(0x108).unwrap());
}

#[test]
fn backdoor_peek_sees_dirty_cache_contents() {
    let mut fabric = default_fabric();
    fabric.cpu_mut().push_write(0x40, 7);
    drain_cpu(&mut fabric);
    assert_eq!(0, fabric.memory().backing().mem().read_word(0x40).unwrap());
    assert_eq!(7, fabric.peek_word(0x40).unwrap());
}

#[test]
fn decode_miss_returns_poison_next_cycle() {
    let mut fabric = default_fabric();
    fabric.cpu_mut().push_read(0x9000_0000);
    tick(&mut fabric, 1);
    assert!(!fabric.cpu().idle());
    tick(&mut fabric, 1);
    assert!(fabric.cpu().idle());

    let response = fabric.cpu().completed()[0].response;
    assert!(response.error);
    assert_eq!(POISON_WORD, response.data);
    assert_eq!(1, fabric.crossbar().stats().decode_faults(CPU));
    assert_eq!(0, fabric.crossbar().stats().total_grants());
}

#[test]
fn register_region_round_trip() {
    let mut fabric = default_fabric();
    fabric.cpu_mut().push_write(CONTROL + 0x10, 5);
    fabric.cpu_mut().push_read(CONTROL + 0x10);
    assert_eq!(4, drain_cpu(&mut fabric), "register targets answer the cycle after grant");
    assert_eq!(5, fabric.cpu().completed()[1].response.data);
    assert_eq!(5, fabric.peek_word(CONTROL + 0x10).unwrap());
    assert_eq!(0, fabric.memory().stats().accesses());
    assert_eq!("control", fabric.targets()[1].name());
}

#[test]
fn distinct_destinations_grant_in_one_cycle() {
    let mut fabric = default_fabric();
    stage_tile(&mut fabric, 0x1000, &identity());
    fabric
        .array_mut()
        .launch(0, Operands { a: 0x1000, b: 0x1000, c: 0x2000 })
        .unwrap();
    tick(&mut fabric, 1);
    fabric.cpu_mut().push_write(CONTROL, 1);
    tick(&mut fabric, 1);
    let route = fabric.last_route();
    assert_eq!(2, route.grants.len());
    assert!(route.grants.iter().any(|g| g.dest == 0 && g.source == 0));
    assert!(route.grants.iter().any(|g| g.dest == 1 && g.source == CPU));
}

#[test]
fn identity_product_on_the_fabric() {
    let mut fabric = default_fabric();
    stage_tile(&mut fabric, 0x1000, &counting(1));
    stage_tile(&mut fabric, 0x1010, &identity());
    fabric
        .array_mut()
        .launch(3, Operands { a: 0x1000, b: 0x1010, c: 0x2000 })
        .unwrap();
    fabric.run_until(10_000, |f| f.array().unit(3).done()).unwrap();
    assert_eq!(UnitStatus::Done, fabric.array().unit(3).status());

    let c = fabric.peek_words(0x2000, DIM * DIM).unwrap();
    let expected: Vec<Word> = (1..=16).collect();
    assert_eq!(expected, c);

    tick(&mut fabric, 1);
    assert_eq!(UnitStatus::Idle, fabric.array().unit(3).status());
    assert_eq!(1, fabric.array().completions(3));
}

#[test]
fn unit_aborts_on_unmapped_operand() {
    let mut fabric = default_fabric();
    fabric
        .array_mut()
        .launch(2, Operands { a: 0x9000_0000, b: 0, c: 0x2000 })
        .unwrap();
    fabric.run_until(100, |f| f.array().unit(2).done()).unwrap();
    assert_eq!(UnitStatus::Error, fabric.array().unit(2).status());
    assert_eq!(1, fabric.crossbar().stats().decode_faults(2));
    tick(&mut fabric, 1);
    assert!(!fabric.array().unit(2).busy());
    assert_eq!(UnitStatus::Error, fabric.array().unit(2).status());
}

#[test]
fn eight_units_complete_once_with_correct_results() {
    let mut fabric = default_fabric();
    let units = fabric.array().len();
    let b_addr: Addr = 0x8000;
    stage_tile(&mut fabric, b_addr, &identity());
    for unit in 0..units {
        let a_addr = 0x1000 + 0x100 * unit as Addr;
        stage_tile(&mut fabric, a_addr, &counting(10 * unit as i8));
        fabric
            .array_mut()
            .launch(
                unit,
                Operands {
                    a: a_addr,
                    b: b_addr,
                    c: 0x4000 + 0x100 * unit as Addr,
                },
            )
            .unwrap();
    }
    // scalar traffic to the same memory competes with the array
    for i in 0..4 {
        fabric.cpu_mut().push_write(0x9000 + 4 * i, i);
    }

    let mut done_pulses = vec![0; units];
    for _ in 0..20_000 {
        if fabric.quiescent() {
            break;
        }
        fabric.tick_one();
        for unit in fabric.array().done_units() {
            done_pulses[unit] += 1;
        }

        let route = fabric.last_route();
        for dest in 0..route.pending.len() {
            let grants: Vec<_> = route.grants.iter().filter(|g| g.dest == dest).collect();
            assert!(grants.len() <= 1, "two grants to destination {dest}");
            let gpu_pending = route.pending[dest][..CPU].iter().any(|&p| p);
            if let Some(grant) = grants.first() {
                assert!(route.pending[dest][grant.source]);
                if gpu_pending {
                    assert_ne!(CPU, grant.source, "CPU granted over a pending unit");
                }
            }
        }
    }
    assert!(fabric.quiescent());
    assert_eq!(vec![1; units], done_pulses);

    for unit in 0..units {
        let c = fabric.peek_words(0x4000 + 0x100 * unit as Addr, DIM * DIM).unwrap();
        let expected: Vec<Word> = (0..16)
            .map(|i| (10 * unit as i8).wrapping_add(i as i8) as i32 as Word)
            .collect();
        assert_eq!(expected, c, "unit {unit}");
        assert_eq!(UnitStatus::Idle, fabric.array().unit(unit).status());
    }
    assert_eq!(4, fabric.crossbar().stats().grants_to(CPU));
}

#[test]
fn reset_preserves_written_memory() {
    let mut fabric = default_fabric();
    fabric.cpu_mut().push_write(0x20, 0x77);
    drain_cpu(&mut fabric);
    fabric.reset().unwrap();
    assert!(fabric.memory().cache().dirty_lines().is_empty());
    assert!(fabric.memory().cache().lookup(0x20).is_none());
    assert_eq!(0x77, fabric.memory().backing().mem().read_word(0x20).unwrap());
    assert_eq!(0, fabric.crossbar().stats().total_grants());
}

#[test]
fn stats_report_per_source_grants() {
    let mut fabric = default_fabric();
    fabric.cpu_mut().push_write(0x0, 1);
    fabric.cpu_mut().push_write(CONTROL, 1);
    drain_cpu(&mut fabric);
    let stats = fabric.stats();
    assert_eq!(2, stats.cpu_grants);
    assert_eq!(2, stats.total_grants());
    let names: Vec<&str> = stats.destinations.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(vec!["main", "control", "diag"], names);
    assert_eq!(1, stats.destinations[0].grants[CPU]);
    assert_eq!(1, stats.destinations[1].grants[CPU]);
    assert_eq!(0, stats.destinations[2].grants.iter().sum::<u64>());
    assert_eq!(1, stats.cache.misses());
    assert!(serde_json::to_string(&stats).unwrap().contains("\"cpu_grants\":2"));
}
