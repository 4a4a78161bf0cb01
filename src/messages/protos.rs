//! Device message bodies, declared with prost derives to match the KeepKey
//! protobuf schema (field tags and types follow `messages.proto` / `types.proto`).

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum FailureType {
    FailureUnexpectedMessage = 1,
    FailureButtonExpected = 2,
    FailureSyntaxError = 3,
    FailureActionCancelled = 4,
    FailurePinExpected = 5,
    FailurePinCancelled = 6,
    FailurePinInvalid = 7,
    FailureInvalidSignature = 8,
    FailureOther = 9,
    FailureNotEnoughFunds = 10,
    FailureNotInitialized = 11,
    FailurePinMismatch = 12,
    FailureFirmwareError = 99,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PinMatrixRequestType {
    Current = 1,
    NewFirst = 2,
    NewSecond = 3,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Initialize {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetFeatures {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ping {
    #[prost(string, optional, tag = "1")]
    pub message: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(bool, optional, tag = "2")]
    pub button_protection: ::core::option::Option<bool>,
    #[prost(bool, optional, tag = "3")]
    pub pin_protection: ::core::option::Option<bool>,
    #[prost(bool, optional, tag = "4")]
    pub passphrase_protection: ::core::option::Option<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Success {
    #[prost(string, optional, tag = "1")]
    pub message: ::core::option::Option<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Failure {
    #[prost(enumeration = "FailureType", optional, tag = "1")]
    pub code: ::core::option::Option<i32>,
    #[prost(string, optional, tag = "2")]
    pub message: ::core::option::Option<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FirmwareErase {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FirmwareUpload {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub payload_hash: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(bytes = "vec", required, tag = "2")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PolicyType {
    #[prost(string, optional, tag = "1")]
    pub policy_name: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(bool, optional, tag = "2")]
    pub enabled: ::core::option::Option<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Features {
    #[prost(string, optional, tag = "1")]
    pub vendor: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(uint32, optional, tag = "2")]
    pub major_version: ::core::option::Option<u32>,
    #[prost(uint32, optional, tag = "3")]
    pub minor_version: ::core::option::Option<u32>,
    #[prost(uint32, optional, tag = "4")]
    pub patch_version: ::core::option::Option<u32>,
    #[prost(bool, optional, tag = "5")]
    pub bootloader_mode: ::core::option::Option<bool>,
    #[prost(string, optional, tag = "6")]
    pub device_id: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(bool, optional, tag = "7")]
    pub pin_protection: ::core::option::Option<bool>,
    #[prost(bool, optional, tag = "8")]
    pub passphrase_protection: ::core::option::Option<bool>,
    #[prost(string, optional, tag = "9")]
    pub language: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(string, optional, tag = "10")]
    pub label: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(bool, optional, tag = "12")]
    pub initialized: ::core::option::Option<bool>,
    #[prost(bytes = "vec", optional, tag = "13")]
    pub revision: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "14")]
    pub bootloader_hash: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(bool, optional, tag = "15")]
    pub imported: ::core::option::Option<bool>,
    #[prost(bool, optional, tag = "16")]
    pub pin_cached: ::core::option::Option<bool>,
    #[prost(bool, optional, tag = "17")]
    pub passphrase_cached: ::core::option::Option<bool>,
    #[prost(message, repeated, tag = "18")]
    pub policies: ::prost::alloc::vec::Vec<PolicyType>,
    #[prost(string, optional, tag = "21")]
    pub model: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(string, optional, tag = "22")]
    pub firmware_variant: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(bytes = "vec", optional, tag = "23")]
    pub firmware_hash: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(bool, optional, tag = "24")]
    pub no_backup: ::core::option::Option<bool>,
    #[prost(bool, optional, tag = "25")]
    pub wipe_code_protection: ::core::option::Option<bool>,
    #[prost(uint32, optional, tag = "26")]
    pub auto_lock_delay_ms: ::core::option::Option<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PinMatrixRequest {
    #[prost(enumeration = "PinMatrixRequestType", optional, tag = "1")]
    pub r#type: ::core::option::Option<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PinMatrixAck {
    #[prost(string, required, tag = "1")]
    pub pin: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Cancel {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClearSession {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ButtonRequest {
    #[prost(uint32, optional, tag = "1")]
    pub code: ::core::option::Option<u32>,
    #[prost(string, optional, tag = "2")]
    pub data: ::core::option::Option<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ButtonAck {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EntropyRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EntropyAck {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub entropy: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PassphraseRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PassphraseAck {
    #[prost(string, required, tag = "1")]
    pub passphrase: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RecoveryDevice {
    #[prost(uint32, optional, tag = "1")]
    pub word_count: ::core::option::Option<u32>,
    #[prost(bool, optional, tag = "2")]
    pub passphrase_protection: ::core::option::Option<bool>,
    #[prost(bool, optional, tag = "3")]
    pub pin_protection: ::core::option::Option<bool>,
    #[prost(string, optional, tag = "4")]
    pub language: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(string, optional, tag = "5")]
    pub label: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(bool, optional, tag = "6")]
    pub enforce_wordlist: ::core::option::Option<bool>,
    #[prost(bool, optional, tag = "7")]
    pub use_character_cipher: ::core::option::Option<bool>,
    #[prost(uint32, optional, tag = "8")]
    pub auto_lock_delay_ms: ::core::option::Option<u32>,
    #[prost(uint32, optional, tag = "9")]
    pub u2f_counter: ::core::option::Option<u32>,
    #[prost(bool, optional, tag = "10")]
    pub dry_run: ::core::option::Option<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CharacterRequest {
    #[prost(uint32, required, tag = "1")]
    pub word_pos: u32,
    #[prost(uint32, required, tag = "2")]
    pub character_pos: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CharacterAck {
    #[prost(string, optional, tag = "1")]
    pub character: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(bool, optional, tag = "2")]
    pub delete: ::core::option::Option<bool>,
    #[prost(bool, optional, tag = "3")]
    pub done: ::core::option::Option<bool>,
}
