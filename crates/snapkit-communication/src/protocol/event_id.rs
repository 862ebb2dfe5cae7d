//! Event id taxonomy and sub-command selectors
//!
//! Odd ids are requests, the following even id is the matching response.
//! Multiplexed categories carry a sub-event id as the first content byte.

/// Frame category selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventId {
    /// G-code request
    GcodeRequest = 0x01,
    /// G-code response
    GcodeResponse = 0x02,
    /// Print G-code request
    PrintGcodeRequest = 0x03,
    /// Print G-code response
    PrintGcodeResponse = 0x04,
    /// File operation request
    FileOperationRequest = 0x05,
    /// File operation response
    FileOperationResponse = 0x06,
    /// Status sync request
    StatusSyncRequest = 0x07,
    /// Status sync response
    StatusSyncResponse = 0x08,
    /// Settings request
    SettingsRequest = 0x09,
    /// Settings response
    SettingsResponse = 0x0a,
    /// Movement request
    MovementRequest = 0x0b,
    /// Movement response
    MovementResponse = 0x0c,
    /// Laser / camera operation request
    LaserCameraRequest = 0x0d,
    /// Laser / camera operation response
    LaserCameraResponse = 0x0e,
}

impl EventId {
    /// Decode a raw event id byte
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x01 => Self::GcodeRequest,
            0x02 => Self::GcodeResponse,
            0x03 => Self::PrintGcodeRequest,
            0x04 => Self::PrintGcodeResponse,
            0x05 => Self::FileOperationRequest,
            0x06 => Self::FileOperationResponse,
            0x07 => Self::StatusSyncRequest,
            0x08 => Self::StatusSyncResponse,
            0x09 => Self::SettingsRequest,
            0x0a => Self::SettingsResponse,
            0x0b => Self::MovementRequest,
            0x0c => Self::MovementResponse,
            0x0d => Self::LaserCameraRequest,
            0x0e => Self::LaserCameraResponse,
            _ => return None,
        })
    }

    /// Raw byte value
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether this id is a request
    pub fn is_request(self) -> bool {
        self.as_u8() % 2 == 1
    }

    /// Response id paired with this request id (identity for responses)
    pub fn response(self) -> Self {
        if self.is_request() {
            // Every odd id in the table has an even successor.
            Self::from_u8(self.as_u8() + 1).unwrap_or(self)
        } else {
            self
        }
    }
}

/// Sub-commands of [`EventId::StatusSyncRequest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StatusSyncCommand {
    /// Query machine status
    QueryStatus = 0x01,
    /// Query abnormal status
    AbnormalStatus = 0x02,
    /// Start print
    StartPrint = 0x03,
    /// Pause print
    Pause = 0x04,
    /// Resume print
    Resume = 0x05,
    /// Stop print
    Stop = 0x06,
    /// Print finished
    Finish = 0x07,
    /// Current line number
    LineNumber = 0x08,
    /// Print progress
    Progress = 0x09,
    /// Reset error flag
    ResetErrorFlag = 0x0a,
    /// Resume from local storage
    ResumeLocal = 0x0b,
    /// Resume from USB storage
    ResumeUsb = 0x0c,
}

/// Sub-commands of [`EventId::SettingsRequest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SettingsCommand {
    /// Start automatic bed calibration
    StartAutoCalibration = 0x02,
    /// Start manual calibration / go to calibration point
    ManualCalibration = 0x04,
    /// Move the current calibration point
    MoveCalibrationPoint = 0x06,
    /// Save calibration
    SaveCalibration = 0x07,
    /// Exit calibration
    ExitCalibration = 0x08,
    /// Reset calibration
    ResetCalibration = 0x09,
    /// Get laser focal length
    LaserFocalLength = 0x0a,
}

impl SettingsCommand {
    /// Map a sub-event id byte
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x02 => Self::StartAutoCalibration,
            0x04 => Self::ManualCalibration,
            0x06 => Self::MoveCalibrationPoint,
            0x07 => Self::SaveCalibration,
            0x08 => Self::ExitCalibration,
            0x09 => Self::ResetCalibration,
            0x0a => Self::LaserFocalLength,
            _ => return None,
        })
    }

    /// Name the setting is reported under
    pub fn setting_name(self) -> &'static str {
        match self {
            Self::StartAutoCalibration => "autoCalibration",
            Self::ManualCalibration => "manualCalibration",
            Self::MoveCalibrationPoint => "calibrationPoint",
            Self::SaveCalibration => "saveCalibration",
            Self::ExitCalibration => "exitCalibration",
            Self::ResetCalibration => "resetCalibration",
            Self::LaserFocalLength => "laserFocalLength",
        }
    }
}

/// Sub-commands of [`EventId::FileOperationRequest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FileCommand {
    /// Mount storage
    Mount = 0x00,
    /// List files
    ListFiles = 0x04,
    /// Print a file by name
    PrintFile = 0x06,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_response_pairing() {
        for raw in (0x01..=0x0d).step_by(2) {
            let request = EventId::from_u8(raw).unwrap();
            assert!(request.is_request());
            assert_eq!(request.response().as_u8(), raw + 1);
            assert!(!request.response().is_request());
        }
        assert_eq!(
            EventId::StatusSyncResponse.response(),
            EventId::StatusSyncResponse
        );
    }

    #[test]
    fn test_settings_sub_commands() {
        for raw in [0x02, 0x04, 0x06, 0x07, 0x08, 0x09, 0x0a] {
            let command = SettingsCommand::from_u8(raw).unwrap();
            assert_eq!(command as u8, raw);
        }
        assert_eq!(SettingsCommand::from_u8(0x03), None);
        assert_eq!(
            SettingsCommand::LaserFocalLength.setting_name(),
            "laserFocalLength"
        );
    }

    #[test]
    fn test_unknown_event_id() {
        assert_eq!(EventId::from_u8(0x00), None);
        assert_eq!(EventId::from_u8(0x0f), None);
    }
}
