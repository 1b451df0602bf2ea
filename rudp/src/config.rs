//! The per-descriptor / process-wide configuration block (spec §3, §12).

/// One recognized configuration option. The discriminant doubles as the
/// index into [ConfigTable]'s backing array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum ConfigOption {
	ConnectTimeoutMs = 0,
	CommandMaxTryCnt,
	MaxSendWindow,
	MaxRecvWindow,
	MtuSize,
	EnableNoDelay,
	UpdateIntervalMs,
	FastResendSkipCnt,
	EnableNoCongestionControl,
	EnableAutoKeepalive,
	EnableStreamMode,
	MaxIdleConnectionTimeMs,
}

impl ConfigOption {
	pub const COUNT: usize = 12;

	pub const ALL: [ConfigOption; Self::COUNT] = [
		Self::ConnectTimeoutMs,
		Self::CommandMaxTryCnt,
		Self::MaxSendWindow,
		Self::MaxRecvWindow,
		Self::MtuSize,
		Self::EnableNoDelay,
		Self::UpdateIntervalMs,
		Self::FastResendSkipCnt,
		Self::EnableNoCongestionControl,
		Self::EnableAutoKeepalive,
		Self::EnableStreamMode,
		Self::MaxIdleConnectionTimeMs,
	];

	/// `(default, min, max)` for this option, per the spec's configuration table.
	const fn bounds(self) -> (i64, i64, i64) {
		match self {
			Self::ConnectTimeoutMs => (250, 10, 20_000),
			Self::CommandMaxTryCnt => (20, 2, 500),
			Self::MaxSendWindow => (128, 2, 32_768),
			Self::MaxRecvWindow => (128, 2, 32_768),
			Self::MtuSize => (1200, 64, 32_768),
			Self::EnableNoDelay => (1, 0, 1),
			Self::UpdateIntervalMs => (10, 1, 5_000),
			Self::FastResendSkipCnt => (0, 0, 10),
			Self::EnableNoCongestionControl => (1, 0, 1),
			Self::EnableAutoKeepalive => (0, 0, 1),
			Self::EnableStreamMode => (0, 0, 1),
			Self::MaxIdleConnectionTimeMs => (10_000, 200, 60_000),
		}
	}

	fn clamp(self, value: i64) -> i64 {
		let (_, min, max) = self.bounds();
		value.clamp(min, max)
	}
}

/// A mapping from [ConfigOption] to integer value. Values are always clamped
/// on write; there is no "invalid value" error for a recognized option, only
/// for an option id that doesn't exist (handled by the caller, not this type).
#[derive(Debug, Clone, Copy)]
pub struct ConfigTable {
	values: [i64; ConfigOption::COUNT],
}

impl ConfigTable {
	/// The built-in system defaults, used to seed both the process-wide
	/// system table and any descriptor created before its own overrides.
	pub fn defaults() -> Self {
		let mut values = [0; ConfigOption::COUNT];

		for opt in ConfigOption::ALL {
			values[opt as usize] = opt.bounds().0;
		}

		Self { values }
	}

	pub fn get(&self, opt: ConfigOption) -> i64 {
		self.values[opt as usize]
	}

	/// Set an option's value, clamping it into `[min, max]`.
	pub fn set(&mut self, opt: ConfigOption, value: i64) {
		self.values[opt as usize] = opt.clamp(value);
	}

	pub fn mtu(&self) -> u32 {
		self.get(ConfigOption::MtuSize) as u32
	}

	pub fn stream_mode(&self) -> bool {
		self.get(ConfigOption::EnableStreamMode) != 0
	}

	pub fn no_delay(&self) -> bool {
		self.get(ConfigOption::EnableNoDelay) != 0
	}

	pub fn no_congestion_control(&self) -> bool {
		self.get(ConfigOption::EnableNoCongestionControl) != 0
	}

	pub fn auto_keepalive(&self) -> bool {
		self.get(ConfigOption::EnableAutoKeepalive) != 0
	}
}

impl Default for ConfigTable {
	fn default() -> Self {
		Self::defaults()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_match_spec_table() {
		let t = ConfigTable::defaults();
		assert_eq!(t.get(ConfigOption::ConnectTimeoutMs), 250);
		assert_eq!(t.get(ConfigOption::CommandMaxTryCnt), 20);
		assert_eq!(t.get(ConfigOption::MaxSendWindow), 128);
		assert_eq!(t.get(ConfigOption::MtuSize), 1200);
		assert_eq!(t.get(ConfigOption::EnableNoCongestionControl), 1);
		assert_eq!(t.get(ConfigOption::MaxIdleConnectionTimeMs), 10_000);
	}

	#[test]
	fn out_of_range_values_are_clamped_not_rejected() {
		let mut t = ConfigTable::defaults();

		t.set(ConfigOption::MtuSize, 10);
		assert_eq!(t.get(ConfigOption::MtuSize), 64);

		t.set(ConfigOption::MtuSize, 1_000_000);
		assert_eq!(t.get(ConfigOption::MtuSize), 32_768);

		t.set(ConfigOption::EnableStreamMode, -5);
		assert_eq!(t.get(ConfigOption::EnableStreamMode), 0);

		t.set(ConfigOption::EnableStreamMode, 5);
		assert_eq!(t.get(ConfigOption::EnableStreamMode), 1);
	}

	#[test]
	fn configure_then_query_round_trips_within_range() {
		let mut t = ConfigTable::defaults();
		t.set(ConfigOption::MaxSendWindow, 256);
		assert_eq!(t.get(ConfigOption::MaxSendWindow), 256);
	}
}
