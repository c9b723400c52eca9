//! Codes of the non-fatal problems provisioners record

/// SSH keys could not be read or generated
pub const NOT_ABLE_TO_PROVISION_SSH_KEYS: u32 = 4200;

/// The user directory failed while reading the git identity
pub const EXCEPTION_IN_USER_MANAGEMENT_DURING_GIT_PROVISION: u32 = 4250;

/// The preferences holding the git identity are not valid JSON
pub const JSON_IS_NOT_A_VALID_REPRESENTATION: u32 = 4251;

/// A command preview port has no service or no ingress exposing it
pub const NOT_ABLE_TO_PROVISION_OBJECTS_FOR_PREVIEW_URL: u32 = 4300;
