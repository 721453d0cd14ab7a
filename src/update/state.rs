//! Update lifecycle as seen from the page.

/// Where the page is in the update lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpdateState {
  /// Not registered (yet, or registration failed / unsupported)
  #[default]
  Unregistered,
  Registering,
  /// Registered with no waiting worker
  Registered,
  /// A waiting worker is ready to take over
  UpdateWaiting,
  /// Skip-waiting sent, waiting for the controller to change
  CutoverRequested,
  Reloading,
}

/// Inputs that drive the page's update state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
  Register,
  Registered,
  RegistrationFailed,
  WaitingPresent,
  WaitingAbsent,
  Cutover,
  ControllerChanged,
}

/// What the update banner shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Banner {
  Hidden,
  Available,
  Updating,
}

impl UpdateState {
  /// Transition table. Unlisted pairs leave the state unchanged.
  pub fn on(self, signal: Signal) -> Self {
    use Signal as S;
    use UpdateState as U;

    match (self, signal) {
      (U::Reloading, _) => U::Reloading,
      (_, S::ControllerChanged) => U::Reloading,

      (U::Unregistered, S::Register) => U::Registering,
      (U::Registering, S::Registered) => U::Registered,
      (U::Registering, S::RegistrationFailed) => U::Unregistered,

      (U::Registered | U::UpdateWaiting, S::WaitingPresent) => U::UpdateWaiting,
      (U::Registered | U::UpdateWaiting, S::WaitingAbsent) => U::Registered,

      (U::UpdateWaiting, S::Cutover) => U::CutoverRequested,

      (state, _) => state,
    }
  }

  /// Banner projection of the state.
  pub fn banner(self) -> Banner {
    match self {
      Self::UpdateWaiting => Banner::Available,
      Self::CutoverRequested | Self::Reloading => Banner::Updating,
      Self::Unregistered | Self::Registering | Self::Registered => Banner::Hidden,
    }
  }
}
