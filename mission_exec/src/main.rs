//! Main mission executable entry point.
//!
//! # Architecture
//!
//! The executable:
//!
//!     - Starts a session and the logger
//!     - Loads and validates the parameters
//!     - Loads the waypoint set
//!     - Connects the services
//!     - Runs the mission, or resumes it from a checkpoint
//!     - Reports the outcome
//!
//! The services are currently provided by the simulation client.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::path::PathBuf;

use color_eyre::{
    eyre::{eyre, WrapErr},
    Report,
};
use log::info;
use structopt::StructOpt;

use mission_lib::{
    auto::{
        loc::transforms::robot_from_tool,
        mission_mgr::{MissionCheckpoint, CHECKPOINT_PATH},
        waypoint::WaypointSet,
    },
    params::MissionExecParams,
    run_mission,
    sim_client::SimWorld,
    MissionMgr, MissionOutcome,
};
use util::{
    host,
    logger::{logger_init, LevelFilter},
    session::Session,
};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, StructOpt)]
#[structopt(name = "mission_exec", about = "Run a survey mission")]
struct Opts {
    /// Waypoint CSV to use instead of the one in the parameters
    #[structopt(long, parse(from_os_str))]
    waypoints: Option<PathBuf>,

    /// Resume the mission from a checkpoint saved by a previous session
    #[structopt(long, parse(from_os_str))]
    resume: Option<PathBuf>,

    /// Log debug messages
    #[structopt(short, long)]
    verbose: bool,
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Executable main function, entry point.
fn main() -> Result<(), Report> {
    color_eyre::install()?;
    let opts = Opts::from_args();

    // ---- EARLY INITIALISATION ----

    let session =
        Session::new("mission_exec", "sessions").wrap_err("Failed to create the session")?;

    let level = if opts.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    logger_init(level, &session).wrap_err("Failed to initialise logging")?;

    info!("Mission Executable\n");
    info!("Session directory: {:?}\n", session.session_root);

    // ---- LOAD PARAMETERS ----

    let params: MissionExecParams =
        util::params::load("mission_exec.toml").wrap_err("Could not load mission params")?;
    params
        .validate()
        .wrap_err("Invalid mission params")?;

    info!("Exec parameters loaded");

    // ---- LOAD WAYPOINTS ----

    let waypoints_path = match opts.waypoints {
        Some(p) => p,
        None => host::get_mission_sw_root()
            .wrap_err("Could not find the software root")?
            .join(&params.waypoints.file),
    };
    let waypoints = WaypointSet::from_csv(&waypoints_path, params.waypoints.row_length)
        .wrap_err_with(|| format!("Could not load waypoints from {:?}", waypoints_path))?;

    // ---- INITIALISE SERVICES ----

    let holes: Vec<_> = waypoints.iter().map(|w| w.position_m).collect();
    let world = SimWorld::from_params(
        &params.sim,
        &holes,
        params.vision.forward_cam.calib.clone(),
        robot_from_tool(params.tool.probe_offset_m_rb),
    );

    info!("Simulated services created");

    // ---- RUN ----

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_time()
        .build()
        .wrap_err("Could not start the runtime")?;

    let outcome = runtime.block_on(run(opts.resume, &params, &waypoints, world))?;

    if params.mission.save_checkpoints {
        info!(
            "Checkpoint saved to {:?}",
            session.session_root.join(CHECKPOINT_PATH)
        );
    }

    // Flush any pending saves
    session.exit();

    match outcome {
        MissionOutcome::Completed => Ok(()),
        MissionOutcome::FailedAt {
            waypoint_index,
            reason,
        } => Err(eyre!(
            "Mission failed at waypoint {} during {}: {}",
            waypoint_index,
            reason.stage,
            reason.error
        )),
    }
}

/// Run a new mission, or resume one from the given checkpoint.
async fn run(
    resume: Option<PathBuf>,
    params: &MissionExecParams,
    waypoints: &WaypointSet,
    world: SimWorld,
) -> Result<MissionOutcome, Report> {
    let mut services = world.services();

    let path = match resume {
        Some(p) => p,
        None => return Ok(run_mission(waypoints, params, &mut services).await),
    };

    let checkpoint = MissionCheckpoint::load(&path)
        .wrap_err_with(|| format!("Could not load checkpoint {:?}", path))?;
    let mut mgr =
        MissionMgr::resume(params, waypoints, checkpoint).wrap_err("Could not resume the mission")?;

    let outcome = mgr.run(&mut services).await;
    services.shutdown().await;

    Ok(outcome)
}
