//! End to end mission runs against the simulated services.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::eqpt::{
    act::{AckResponse, ActCmd, CommandId},
    cam::CamId,
};
use mission_lib::{
    auto::{
        loc::transforms::robot_from_tool,
        mission_mgr::{MissionMgrState, MissionSummary, Transition, WaypointStatus},
        waypoint::WaypointSet,
    },
    params::MissionExecParams,
    run_mission,
    sim_client::{detection, SimWorld},
    MissionMgr, MissionOutcome,
};
use tokio::sync::mpsc::UnboundedReceiver;

// ------------------------------------------------------------------------------------------------
// HELPERS
// ------------------------------------------------------------------------------------------------

const DEMO_WAYPOINTS: &str = include_str!("../../params/waypoints/demo.csv");

fn params() -> MissionExecParams {
    let mut params: MissionExecParams =
        util::params::from_str(include_str!("../../params/mission_exec.toml")).unwrap();
    params.validate().unwrap();

    params.vision.enabled = false;
    params.mission.save_checkpoints = false;
    params
}

fn demo_waypoints(params: &MissionExecParams) -> WaypointSet {
    WaypointSet::from_reader(DEMO_WAYPOINTS.as_bytes(), params.waypoints.row_length).unwrap()
}

/// A world whose cameras see the true holes, offset from the surveyed ones.
fn projected_world(params: &MissionExecParams, waypoints: &WaypointSet) -> SimWorld {
    let holes: Vec<_> = waypoints.iter().map(|w| w.position_m).collect();
    SimWorld::from_params(
        &params.sim,
        &holes,
        params.vision.forward_cam.calib.clone(),
        robot_from_tool(params.tool.probe_offset_m_rb),
    )
}

fn drain(rx: &mut UnboundedReceiver<Transition>) -> Vec<Transition> {
    let mut out = Vec::new();
    while let Ok(t) = rx.try_recv() {
        out.push(t);
    }
    out
}

fn count_to(transitions: &[Transition], state: MissionMgrState) -> usize {
    transitions.iter().filter(|t| t.to == state).count()
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn demo_mission_completes() {
    let params = params();
    let waypoints = demo_waypoints(&params);
    assert_eq!(waypoints.len(), 6);
    assert_eq!(waypoints.num_rows(), 2);

    let world = SimWorld::default();
    let mut services = world.services();

    let mut mgr = MissionMgr::new(&params, &waypoints);
    let mut rx = mgr.subscribe();
    let outcome = mgr.run(&mut services).await;
    assert_eq!(outcome, MissionOutcome::Completed);

    let transitions = drain(&mut rx);
    assert_eq!(count_to(&transitions, MissionMgrState::Deploying), 6);
    assert_eq!(count_to(&transitions, MissionMgrState::Recovering), 0);
    assert_eq!(
        transitions.last().map(|t| t.to),
        Some(MissionMgrState::Complete)
    );

    // Approach and final track per waypoint, plus the row turn
    assert_eq!(world.submitted_tracks().len(), 6 * 2 + 1);

    let probes = world
        .sent_commands()
        .into_iter()
        .filter(|c| *c == ActCmd::DeployProbe)
        .count();
    assert_eq!(probes, 6);

    // The base is left stopped
    assert_eq!(world.sent_commands().last(), Some(&ActCmd::stop()));

    assert_eq!(
        mgr.summary(),
        MissionSummary {
            completed: 6,
            ..Default::default()
        }
    );
}

#[tokio::test(start_paused = true)]
async fn single_row_without_vision() {
    let params = params();
    let waypoints = WaypointSet::from_reader("dx,dy\n0,0\n0,2\n".as_bytes(), None).unwrap();
    assert_eq!(waypoints.num_rows(), 1);

    let world = SimWorld::default();
    let mut services = world.services();

    let mut mgr = MissionMgr::new(&params, &waypoints);
    let mut rx = mgr.subscribe();
    let outcome = mgr.run(&mut services).await;
    assert_eq!(outcome, MissionOutcome::Completed);

    let transitions = drain(&mut rx);
    assert_eq!(count_to(&transitions, MissionMgrState::Deploying), 2);
    assert_eq!(count_to(&transitions, MissionMgrState::Detecting), 0);
    assert_eq!(
        transitions.last().map(|t| t.to),
        Some(MissionMgrState::Complete)
    );
}

#[tokio::test(start_paused = true)]
async fn refined_holes_are_stemmed() {
    let mut params = params();
    params.vision.enabled = true;
    let waypoints = WaypointSet::from_reader("dx,dy\n0,0\n0,2\n".as_bytes(), None).unwrap();

    // The robot starts exactly the approach offset back from the first hole, and every true
    // hole is 11 cm from where it was surveyed, more than the tool can tolerate
    let world = projected_world(&params, &waypoints);
    let mut services = world.services();

    let mut mgr = MissionMgr::new(&params, &waypoints);
    let mut rx = mgr.subscribe();
    let outcome = mgr.run(&mut services).await;
    assert_eq!(outcome, MissionOutcome::Completed);

    let transitions = drain(&mut rx);
    assert_eq!(count_to(&transitions, MissionMgrState::Refining), 2);
    assert_eq!(count_to(&transitions, MissionMgrState::Recovering), 0);
    assert!(transitions
        .iter()
        .filter(|t| t.from == MissionMgrState::Detecting)
        .all(|t| t.to == MissionMgrState::Refining));

    for record in mgr.records() {
        assert_eq!(record.status, WaypointStatus::Completed);
        assert_eq!(record.attempts, 1);
    }

    let probes = world
        .sent_commands()
        .into_iter()
        .filter(|c| *c == ActCmd::DeployProbe)
        .count();
    assert_eq!(probes, 2);

    // Final tracks square up along the row
    for track in world.submitted_tracks().iter().skip(1).step_by(2) {
        let end = track.points.last().unwrap();
        assert!(end.heading_rad.abs() < 1e-6);
    }
}

#[tokio::test(start_paused = true)]
async fn confirmation_pass_keeps_refined_hole() {
    let mut params = params();
    params.vision.enabled = true;
    params.vision.confirmation_pass = true;
    let waypoints = WaypointSet::from_reader("dx,dy\n0,0\n0,2\n".as_bytes(), None).unwrap();

    let world = projected_world(&params, &waypoints);
    let mut services = world.services();

    let mut mgr = MissionMgr::new(&params, &waypoints);
    let mut rx = mgr.subscribe();
    let outcome = mgr.run(&mut services).await;
    assert_eq!(outcome, MissionOutcome::Completed);

    let transitions = drain(&mut rx);
    assert_eq!(count_to(&transitions, MissionMgrState::Refining), 2);
    assert_eq!(
        mgr.summary(),
        MissionSummary {
            completed: 2,
            ..Default::default()
        }
    );
}

#[tokio::test(start_paused = true)]
async fn broken_tool_skips_waypoints() {
    let mut params = params();
    params.mission.max_stage_retries = 1;
    params.mission.max_skips = 6;
    let waypoints = WaypointSet::from_reader("dx,dy\n0,0\n0,2\n".as_bytes(), None).unwrap();

    let world = SimWorld::default();
    world.set_ack_default(CommandId::ProbeDeploy, AckResponse::Negative);
    let mut services = world.services();

    let mut mgr = MissionMgr::new(&params, &waypoints);
    let outcome = mgr.run(&mut services).await;
    assert_eq!(outcome, MissionOutcome::Completed);

    for record in mgr.records() {
        assert_eq!(record.status, WaypointStatus::Skipped);
        assert_eq!(record.attempts, 2);
        assert!(record.finished_at.is_some());
    }
    assert_eq!(mgr.state().skips, 2);
}

#[tokio::test(start_paused = true)]
async fn tool_timeout_leaves_chute_closed() {
    let mut params = params();
    params.mission.max_stage_retries = 0;
    params.mission.max_skips = 1;
    params.mission.deploy_timeout_s = 1.0;
    let waypoints = WaypointSet::from_reader("dx,dy\n0,0\n".as_bytes(), None).unwrap();

    let world = SimWorld::default();
    world.set_ack_default(CommandId::ProbeDeploy, AckResponse::None);
    let mut services = world.services();

    let mut mgr = MissionMgr::new(&params, &waypoints);
    let outcome = mgr.run(&mut services).await;
    assert_eq!(outcome, MissionOutcome::Completed);

    let record = &mgr.records()[0];
    assert_eq!(record.status, WaypointStatus::Skipped);
    assert_eq!(record.failures[0].stage, MissionMgrState::Deploying);
    assert!(record.failures[0].error.contains("did not finish"));

    let sent = world.sent_commands();
    let probe = sent
        .iter()
        .position(|c| *c == ActCmd::DeployProbe)
        .unwrap();
    assert_eq!(
        &sent[probe + 1..probe + 3],
        &[ActCmd::Dispenser { open: false }, ActCmd::stop()]
    );
}

#[tokio::test(start_paused = true)]
async fn unseen_hole_falls_back_to_survey() {
    let mut params = params();
    params.vision.enabled = true;
    let waypoints = WaypointSet::from_reader("dx,dy\n0,0\n0,2\n".as_bytes(), None).unwrap();

    // The default world's forward camera sees nothing
    let world = SimWorld::default();
    world.set_pose(-4.0, 0.5, 0.0);
    let mut services = world.services();

    let mut mgr = MissionMgr::new(&params, &waypoints);
    let mut rx = mgr.subscribe();
    let outcome = mgr.run(&mut services).await;
    assert_eq!(outcome, MissionOutcome::Completed);

    let transitions = drain(&mut rx);
    assert_eq!(count_to(&transitions, MissionMgrState::Detecting), 2);
    assert_eq!(count_to(&transitions, MissionMgrState::Refining), 0);
    assert!(transitions
        .iter()
        .filter(|t| t.from == MissionMgrState::Detecting)
        .all(|t| t.to == MissionMgrState::Executing));
}

#[tokio::test(start_paused = true)]
async fn distant_detection_is_rejected() {
    let mut params = params();
    params.vision.enabled = true;
    params.vision.confirmation_pass = true;
    let waypoints = WaypointSet::from_reader("dx,dy\n0,0\n".as_bytes(), None).unwrap();

    // Something far down the field, well outside the search zone of the hole
    let world = SimWorld::default();
    world.set_forward_detections(vec![detection(CamId::Forward, 0.5, 0.5, Some(20.0))]);
    let mut services = world.services();

    let mut mgr = MissionMgr::new(&params, &waypoints);
    let mut rx = mgr.subscribe();
    let outcome = mgr.run(&mut services).await;
    assert_eq!(outcome, MissionOutcome::Completed);

    let transitions = drain(&mut rx);
    assert_eq!(count_to(&transitions, MissionMgrState::Detecting), 1);
    assert_eq!(count_to(&transitions, MissionMgrState::Refining), 0);
    assert_eq!(mgr.records()[0].status, WaypointStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn run_mission_shuts_down_on_failure() {
    let mut params = params();
    params.mission.max_stage_retries = 0;
    params.mission.max_skips = 0;
    params.conv_guard.max_retries = 1;
    let waypoints = demo_waypoints(&params);

    let world = SimWorld::default();
    world.set_converge_after_rotations(None);
    let mut services = world.services();

    let outcome = run_mission(&waypoints, &params, &mut services).await;
    match outcome {
        MissionOutcome::FailedAt {
            waypoint_index,
            reason,
        } => {
            assert_eq!(waypoint_index, 0);
            assert_eq!(reason.stage, MissionMgrState::Planning);
        }
        o => panic!("Expected failure, got {:?}", o),
    }

    assert_eq!(world.rotations().len(), 1);
    assert!(world.submitted_tracks().is_empty());
}
