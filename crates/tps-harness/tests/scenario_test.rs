//! Every scenario passes on the default backend and logs valid JSONL.

use tps_core::TpsConfig;
use tps_harness::structured_log::validate_log_line;
use tps_harness::{LogEmitter, ScenarioError, ScenarioKind, ScenarioReport, run_scenario};

type Run = (Result<ScenarioReport, ScenarioError>, Vec<String>);

fn run(kind: ScenarioKind, config: TpsConfig) -> Run {
    let mut log = LogEmitter::to_buffer("scenario-test");
    let result = run_scenario(kind, config, &mut log);
    (result, log.buffered_lines())
}

#[test]
fn all_scenarios_pass_and_log_valid_lines() {
    for kind in ScenarioKind::ALL {
        let (result, lines) = run(kind, TpsConfig::default());
        let report = result.unwrap_or_else(|err| panic!("{}: {err}", kind.name()));
        assert_eq!(report.kind, kind);
        assert!(report.steps > 0);
        assert_eq!(report.metrics.pages_outstanding(), 0, "{}", kind.name());

        // start + one line per step + end
        assert_eq!(lines.len(), report.steps + 2, "{}", kind.name());
        for (i, line) in lines.iter().enumerate() {
            let entry = validate_log_line(line, i + 1)
                .unwrap_or_else(|errs| panic!("{line}: {}", errs[0]));
            assert_eq!(entry.scenario.as_deref(), Some(kind.name()));
        }
        assert!(lines[0].contains("\"scenario_start\""));
        assert!(lines[lines.len() - 1].contains("\"scenario_end\""));
    }
}

#[test]
fn cow_handoff_forks_exactly_once() {
    let (result, lines) = run(ScenarioKind::CowHandoff, TpsConfig::default());
    let report = result.expect("cow-handoff");
    assert_eq!(report.metrics.cow_forks, 1);
    assert_eq!(report.metrics.clones, 1);
    assert!(
        lines
            .iter()
            .any(|l| l.contains("\"thread\":\"sharer\"") && l.contains("\"op\":\"clone\""))
    );
}

#[test]
fn error_cases_log_expected_errnos() {
    let (result, lines) = run(ScenarioKind::ErrorCases, TpsConfig::default());
    result.expect("error-cases");
    for errno in [libc::ENOENT, libc::EEXIST, libc::ERANGE, libc::EFAULT, libc::EBUSY] {
        let needle = format!("\"errno\":{errno}");
        assert!(lines.iter().any(|l| l.contains(&needle)), "missing {needle}");
    }
    assert!(lines.iter().all(|l| !l.contains("\"outcome\":\"fail\"")));
}

#[test]
fn page_budget_failure_is_reported() {
    // The diverging reader cannot fork once the single page is spent.
    let config = TpsConfig::default().with_max_pages(1);
    let (result, lines) = run(ScenarioKind::ManyReaders, config);
    result.expect_err("budget exhausted");

    let enomem = format!("\"errno\":{}", libc::ENOMEM);
    assert!(
        lines.iter().any(|l| l.contains("\"op\":\"write\"")
            && l.contains("\"outcome\":\"fail\"")
            && l.contains(&enomem)),
        "{lines:#?}"
    );

    let last = lines.last().expect("end line");
    assert!(last.contains("\"scenario_end\""));
    assert!(last.contains("\"outcome\":\"fail\""));
}
