use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use rc_types::RacerResult;
use tracing::info;

use crate::runhistory::{RunHistory, RunHistorySnapshot};
use crate::trajectory::Trajectory;

const RUNHISTORY_FILE: &str = "runhistory.json";
const TRAJECTORY_FILE: &str = "trajectory.json";

/// JSON storage for run histories and trajectories
#[derive(Debug)]
pub struct RunHistoryStore {
    pub data_root: PathBuf,
}

impl RunHistoryStore {
    pub fn new<P: AsRef<Path>>(data_root: P) -> RacerResult<Self> {
        let data_root = data_root.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_root)?;

        Ok(Self { data_root })
    }

    pub fn runhistory_path(&self) -> PathBuf {
        self.data_root.join(RUNHISTORY_FILE)
    }

    pub fn trajectory_path(&self) -> PathBuf {
        self.data_root.join(TRAJECTORY_FILE)
    }

    /// Write both files, replacing previous contents
    pub fn save(&self, history: &RunHistory, trajectory: &Trajectory) -> RacerResult<()> {
        let writer = BufWriter::new(File::create(self.runhistory_path())?);
        serde_json::to_writer_pretty(writer, &history.snapshot())?;

        let writer = BufWriter::new(File::create(self.trajectory_path())?);
        serde_json::to_writer_pretty(writer, trajectory)?;

        info!(
            root = %self.data_root.display(),
            trials = history.len(),
            incumbents = trajectory.len(),
            "saved run history"
        );
        Ok(())
    }

    pub fn load_history(&self) -> RacerResult<RunHistory> {
        let reader = BufReader::new(File::open(self.runhistory_path())?);
        let snapshot: RunHistorySnapshot = serde_json::from_reader(reader)?;
        RunHistory::from_snapshot(snapshot)
    }

    pub fn load_trajectory(&self) -> RacerResult<Trajectory> {
        let reader = BufReader::new(File::open(self.trajectory_path())?);
        Ok(serde_json::from_reader(reader)?)
    }
}
