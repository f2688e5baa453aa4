use serde::{Deserialize, Serialize};

/// Query methods a client can ask the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
  // Symbol queries
  FollowLocation, ReferencesLocation, ReferencesName,
  ListSymbols, FindSymbols, Dependencies,
  // Index state
  IsIndexing, IsIndexed, Sources, Reindex, RemoveFile, SuspendFile,
  // Project management
  Project, ReloadProjects, ClearProjects, RemoveProject, UnloadProject,
  // Daemon control
  JobCount, Status, DumpJobs, Shutdown,
}
