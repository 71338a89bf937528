use std::collections::BTreeSet;

use test_log::test;

use ap_verify::config::{CheckerMode, MergeThresholds, VerifierConfig};
use ap_verify::header::parse_ip;
use ap_verify::loader::NetworkSpec;
use ap_verify::network::Network;
use ap_verify::topology::Position;

fn spec(topology: &str) -> NetworkSpec {
    let mut spec = NetworkSpec::default();
    spec.parse_topology(topology).unwrap();
    spec
}

fn pos(d: &str, p: &str) -> Position {
    Position::new(d, p)
}

const TWO_NODES: &str = "a eth0 b eth0\nb eth0 a eth0\n";

/// Apply `lines` one by one and collect `(loops, blackholes)` of every update.
fn replay(net: &mut Network, lines: &[&str]) -> Vec<(usize, usize)> {
    lines
        .iter()
        .map(|line| {
            let report = net.apply_line(line).unwrap();
            (report.loops, report.blackholes)
        })
        .collect()
}

#[test]
fn test_two_device_loop() {
    let mut net = Network::new("two", VerifierConfig::default(), &spec(TWO_NODES)).unwrap();
    let first = net.apply_line("+ forward a 10.0.0.0 8 eth0 8").unwrap();
    assert_eq!(first.loops, 0);
    assert_eq!(first.moved_aps, 1);

    let second = net.apply_line("+ forward b 10.0.0.0 8 eth0 8").unwrap();
    assert_eq!(second.loops, 1);

    let records: Vec<_> = net.loops().iter().collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].path, vec![pos("a", "eth0"), pos("b", "eth0")]);
    let hs = net.header_space();
    let p8 = hs.dst_prefix(parse_ip("10.0.0.0").unwrap(), 8);
    assert_eq!(records[0].aps, BTreeSet::from([p8]));
    assert_eq!(net.dump_loops(), vec!["(a,eth0) -> (b,eth0): 10.0.0.0/8"]);
    net.partition().check_invariants().unwrap();
}

#[test]
fn test_universal_blackhole() {
    let mut spec = NetworkSpec::default();
    spec.parse_devices("a\n").unwrap();

    for checker in [CheckerMode::Direct, CheckerMode::Graph] {
        let config = VerifierConfig::default().with_checker(checker);
        let net = Network::new("single", config, &spec).unwrap();
        assert_eq!(net.ap_count(), 1);

        let one = net.header_space().one();
        let report = net.check("a", &BTreeSet::from([one])).unwrap();
        assert!(report.loops.is_empty());
        let holes: Vec<_> = report.blackholes.iter().collect();
        assert_eq!(holes.len(), 1);
        assert_eq!(holes[0].0, &pos("a", "default"));
        assert_eq!(holes[0].1, &BTreeSet::from([one]));
    }
}

#[test]
fn test_remove_breaks_loop() {
    let mut net = Network::new("two", VerifierConfig::default(), &spec(TWO_NODES)).unwrap();
    let counts = replay(
        &mut net,
        &[
            "+ forward a 10.0.0.0 8 eth0 8",
            "+ forward b 10.0.0.0 8 eth0 8",
            "- forward b 10.0.0.0 8 eth0 8",
        ],
    );
    assert_eq!(counts[1].0, 1);
    assert_eq!(counts[2].0, 0);
    // The removal sends the traffic back to b's default port.
    assert_eq!(counts[2].1, 1);
    assert_eq!(net.ap_count_after_inserts(), Some(2));

    let again = net.apply_line("+ forward b 10.0.0.0 8 eth0 8").unwrap();
    assert_eq!(again.loops, 1);
    assert_eq!(net.loops().len(), 1);
    net.partition().check_invariants().unwrap();
}

#[test]
fn test_deterministic_results() {
    let lines = [
        "+ forward a 10.0.0.0 8 eth0 8",
        "+ forward a 10.1.0.0 16 eth0 16",
        "+ forward b 10.0.0.0 8 eth0 8",
        "+ forward b 10.1.0.0 16 default 16",
        "- forward a 10.1.0.0 16 eth0 16",
    ];
    let run = || {
        let mut net = Network::new("two", VerifierConfig::default(), &spec(TWO_NODES)).unwrap();
        let counts = replay(&mut net, &lines);
        (counts, net.dump_loops())
    };
    assert_eq!(run(), run());
}

#[test]
fn test_graph_matches_direct() {
    let streams: [(&str, &str, &[&str]); 3] = [
        (
            TWO_NODES,
            "",
            &[
                "+ forward a 10.0.0.0 8 eth0 8",
                "+ forward b 10.0.0.0 8 eth0 8",
                "+ forward a 10.1.0.0 16 default 16",
                "- forward b 10.0.0.0 8 eth0 8",
            ],
        ),
        (
            "a eth1 b eth0\nb eth0 a eth1\n",
            "a eth1\n",
            &[
                "+ nat a eth1 10.0.0.0 8 192.168.0.0 16",
                "+ forward a 10.0.0.0 8 eth1 8",
                "+ forward b 192.168.0.0 16 eth0 16",
                "+ forward a 192.168.0.0 16 eth1 16",
            ],
        ),
        (
            "a eth1 b eth0\nb eth0 a eth1\na eth2 c eth0\n",
            "",
            &["+ forward b 10.0.0.0 8 eth0 8", "+ forward a 10.0.0.0 8 vlan10 8"],
        ),
    ];

    for (topology, nats, lines) in streams {
        let mut s = spec(topology);
        s.parse_nats(nats).unwrap();
        s.parse_vlans("a vlan10 eth1 eth2\n").unwrap();

        let mut direct = Network::new("direct", VerifierConfig::default(), &s).unwrap();
        let graph_config = VerifierConfig::default().with_checker(CheckerMode::Graph);
        let mut graph = Network::new("graph", graph_config, &s).unwrap();

        assert_eq!(replay(&mut direct, lines), replay(&mut graph, lines));
        assert_eq!(direct.dump_loops(), graph.dump_loops());
    }
}

#[test]
fn test_nat_loop() {
    let mut s = spec("a eth1 b eth0\nb eth0 a eth1\n");
    s.parse_nats("a eth1\n").unwrap();
    let mut net = Network::new("nat", VerifierConfig::default(), &s).unwrap();

    let counts = replay(
        &mut net,
        &[
            "+ nat a eth1 10.0.0.0 8 192.168.0.0 16",
            "+ forward a 10.0.0.0 8 eth1 8",
            "+ forward b 192.168.0.0 16 eth0 16",
            "+ forward a 192.168.0.0 16 eth1 16",
        ],
    );
    assert_eq!(counts.iter().map(|c| c.0).collect::<Vec<_>>(), vec![0, 0, 0, 1]);

    let record = net.loops().iter().next().unwrap();
    assert_eq!(
        record.path,
        vec![pos("a", "eth1"), pos("a_eth1", "default"), pos("b", "eth0")]
    );

    let hs = net.header_space();
    let old = hs.dst_prefix(parse_ip("10.0.0.0").unwrap(), 8);
    let new = hs.dst_prefix(parse_ip("192.168.0.0").unwrap(), 16);
    let nat = net.partition().element_by_name("a_eth1").unwrap();
    let outputs = nat.rewrite_table().unwrap().outputs(old).unwrap();
    assert_eq!(hs.or_all(outputs.iter().copied()), new);
    net.partition().check_invariants().unwrap();
}

const ACL_TOPOLOGY: &str = "\
a eth0 a_acl1_in in
a_acl1_in permit b eth0
b eth0 a eth0
";

fn acl_lines() -> [&'static str; 4] {
    [
        "+ forward a 10.0.0.0 8 eth0 8",
        "+ forward b 10.0.0.0 8 eth0 8",
        "+ acl a_acl1 10 permit any any any 10.0.0.0/8 any",
        "- acl a_acl1 10 permit any any any 10.0.0.0/8 any",
    ]
}

#[test]
fn test_acl_gates_loop() {
    for division in [false, true] {
        let mut s = spec(ACL_TOPOLOGY);
        s.parse_acls("a acl1\n").unwrap();
        let config = VerifierConfig::default().with_division(division);
        let mut net = Network::new("acl", config, &s).unwrap();
        assert_eq!(net.acl_partition().is_some(), division);

        let counts = replay(&mut net, &acl_lines());
        let loops: Vec<usize> = counts.iter().map(|c| c.0).collect();
        assert_eq!(loops, vec![0, 0, 1, 0], "division = {}", division);

        let record = net.loops().iter().next().unwrap();
        assert_eq!(
            record.path,
            vec![pos("a", "eth0"), pos("a_acl1_in", "permit"), pos("b", "eth0")]
        );
        net.partition().check_invariants().unwrap();
        if let Some(acl) = net.acl_partition() {
            acl.check_invariants().unwrap();
        }
    }
}

#[test]
fn test_graph_matches_direct_division() {
    for declared in [true, false] {
        let mut s = spec(ACL_TOPOLOGY);
        if declared {
            s.parse_acls("a acl1\n").unwrap();
        }
        let run = |checker| {
            let config = VerifierConfig::default().with_division(true).with_checker(checker);
            let mut net = Network::new("acl", config, &s).unwrap();
            let counts = replay(&mut net, &acl_lines());
            (counts, net.dump_loops())
        };
        let (direct, direct_loops) = run(CheckerMode::Direct);
        let (graph, graph_loops) = run(CheckerMode::Graph);
        assert_eq!(direct, graph, "declared = {}", declared);
        assert_eq!(direct.iter().map(|c| c.0).collect::<Vec<_>>(), vec![0, 0, 1, 0]);
        assert_eq!(direct_loops, graph_loops);
    }
}

#[test]
fn test_deny_overlap_is_informational() {
    let mut s = spec(ACL_TOPOLOGY);
    s.parse_acls("a acl1\n").unwrap();
    for checker in [CheckerMode::Direct, CheckerMode::Graph] {
        let config = VerifierConfig::default().with_division(true).with_checker(checker);
        let mut net = Network::new("acl", config, &s).unwrap();
        replay(&mut net, &acl_lines()[..2]);

        let p8 = net.header_space().dst_prefix(parse_ip("10.0.0.0").unwrap(), 8);
        let report = net.check("a", &BTreeSet::from([p8])).unwrap();
        assert_eq!(report.denied_overlaps, 1, "{:?}", checker);
        assert!(report.loops.is_empty());
        assert!(report.blackholes.is_empty());
    }
}

/// Stream with a loop whose predicates merge in the update that reports it.
const MERGING_LINES: [&str; 8] = [
    "+ forward a 10.0.0.0 8 eth0 8",
    "+ forward b 10.128.0.0 9 eth0 9",
    "+ forward b 10.0.0.0 9 eth0 9",
    "+ forward c 10.0.0.0 10 eth0 10",
    "+ forward a 10.64.0.0 10 eth1 10",
    "- forward b 10.128.0.0 9 eth0 9",
    "- forward a 10.64.0.0 10 eth1 10",
    "+ forward b 10.128.0.0 9 eth0 9",
];

fn eager_merge() -> VerifierConfig {
    VerifierConfig::default().with_merge_thresholds(MergeThresholds {
        total_aps: 500,
        low_mergeable: 1,
        high_mergeable: 1,
    })
}

#[test]
fn test_loops_independent_of_merging() {
    let mut s = spec(TWO_NODES);
    s.parse_devices("c\n").unwrap();

    let configs = [
        VerifierConfig::default().with_merge_aps(false),
        VerifierConfig::default(),
        eager_merge(),
        eager_merge().with_gc_interval(1),
    ];
    let results: Vec<_> = configs
        .into_iter()
        .map(|config| {
            let mut net = Network::new("merge", config, &s).unwrap();
            let counts = replay(&mut net, &MERGING_LINES);
            net.partition().check_invariants().unwrap();
            (counts, net.dump_loops())
        })
        .collect();

    for result in &results[1..] {
        assert_eq!(result, &results[0]);
    }
    assert_eq!(results[0].1, vec!["(a,eth0) -> (b,eth0): 10.0.0.0/8"]);
}

#[test]
fn test_gc_keeps_merged_loop_predicates() {
    let mut s = spec(TWO_NODES);
    s.parse_devices("c\n").unwrap();
    let mut net = Network::new("gc", eager_merge().with_gc_interval(1), &s).unwrap();

    let counts = replay(&mut net, &MERGING_LINES[..3]);
    assert_eq!(counts[2].0, 1);
    // Both halves of 10/8 were merged right after the check.
    assert_eq!(net.ap_count(), 2);

    // Reuse the freed node slots.
    replay(
        &mut net,
        &[
            "+ forward c 172.16.0.0 12 eth0 12",
            "+ forward c 192.168.0.0 16 eth0 16",
            "+ forward c 10.0.0.0 9 eth0 9",
        ],
    );
    net.collect_garbage();
    assert_eq!(net.dump_loops(), vec!["(a,eth0) -> (b,eth0): 10.0.0.0/8"]);
    let hs = net.header_space();
    let p8 = hs.dst_prefix(parse_ip("10.0.0.0").unwrap(), 8);
    let record = net.loops().iter().next().unwrap();
    assert_eq!(hs.or_all(record.aps.iter().copied()), p8);
}

#[test]
fn test_vlan_no_reflection() {
    let mut s = spec("a eth1 b eth0\nb eth0 a eth1\na eth2 c eth0\n");
    s.parse_vlans("a vlan10 eth1 eth2\n").unwrap();
    let mut net = Network::new("vlan", VerifierConfig::default(), &s).unwrap();

    net.apply_line("+ forward b 10.0.0.0 8 eth0 8").unwrap();
    let report = net.apply_line("+ forward a 10.0.0.0 8 vlan10 8").unwrap();
    assert_eq!(report.loops, 0);
    assert_eq!(report.blackholes, 1);
    assert!(net
        .blackholes()
        .iter()
        .any(|(p, _)| *p == pos("c", "default")));
}

#[test]
fn test_link_failures() {
    let topology = "a eth0 b eth0\nb eth0 a eth0\nc eth0 a eth9\n";
    let mut net = Network::new("lf", VerifierConfig::default(), &spec(topology)).unwrap();
    replay(
        &mut net,
        &[
            "+ forward a 10.0.0.0 8 eth0 8",
            "+ forward b 10.0.0.0 8 eth0 8",
            "+ forward c 10.0.0.0 8 eth0 8",
        ],
    );

    let reports = net.check_all_link_failures().unwrap();
    assert_eq!(reports.len(), 3);
    let summary: Vec<(Position, usize, usize)> = reports
        .iter()
        .map(|r| (r.from.clone(), r.affected_aps, r.loops))
        .collect();
    assert_eq!(
        summary,
        vec![
            (pos("a", "eth0"), 1, 0),
            (pos("b", "eth0"), 1, 0),
            (pos("c", "eth0"), 1, 1),
        ]
    );
}

#[test]
fn test_run_skips_bad_updates() {
    let mut net = Network::new("two", VerifierConfig::default(), &spec(TWO_NODES)).unwrap();
    let summary = net
        .run([
            "+ forward a 10.0.0.0 8 eth0 8",
            "+ forward zz 10.0.0.0 8 eth0 8",
            "+ forward a 10.0.0.0 eth0 8",
            "+ forward b 10.0.0.0 8 eth0 8",
            "- forward b 10.0.0.0 8 eth0 8",
        ])
        .unwrap();
    assert_eq!(summary.updates, 3);
    assert_eq!(summary.inserts, 2);
    assert_eq!(summary.removes, 1);
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.loops, 1);
    assert_eq!(summary.ap_count_after_inserts, Some(2));
}

#[test]
fn test_gc_keeps_state() {
    let config = VerifierConfig::default().with_gc_interval(1);
    let mut net = Network::new("gc", config, &spec(TWO_NODES)).unwrap();
    let counts = replay(
        &mut net,
        &[
            "+ forward a 10.0.0.0 8 eth0 8",
            "+ forward a 10.1.0.0 16 eth0 16",
            "+ forward b 10.0.0.0 8 eth0 8",
            "- forward a 10.1.0.0 16 eth0 16",
            "+ forward a 10.1.0.0 16 eth0 16",
        ],
    );
    assert_eq!(counts[2].0, 1);
    net.collect_garbage();
    net.partition().check_invariants().unwrap();
    assert_eq!(net.dump_loops(), vec!["(a,eth0) -> (b,eth0): 10.0.0.0/8"]);
}

#[test]
fn test_merge_disabled() {
    let config = VerifierConfig::default().with_merge_aps(false);
    let mut net = Network::new("two", config, &spec(TWO_NODES)).unwrap();
    replay(
        &mut net,
        &["+ forward a 10.0.0.0 8 eth0 8", "- forward a 10.0.0.0 8 eth0 8"],
    );
    // Without merging the split stays.
    assert_eq!(net.ap_count(), 2);
    assert_eq!(net.partition().mergeable_count(), 0);

    let mut merging = Network::new("two", VerifierConfig::default(), &spec(TWO_NODES)).unwrap();
    replay(
        &mut merging,
        &["+ forward a 10.0.0.0 8 eth0 8", "- forward a 10.0.0.0 8 eth0 8"],
    );
    assert_eq!(merging.hard_merge().unwrap(), 1);
    assert_eq!(merging.ap_count(), 1);
}
