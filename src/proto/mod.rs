//! Protocol Buffer definitions shared by every service of the game platform.
//!
//! Only the shared error enumeration lives here. Table records are owned by the
//! services that persist them and plug into [`crate::HashRecord`].

pub mod error {
    /// Wire-level response codes. Zero is success, every failure is negative.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum ErrorCode {
        Success = 0,
        Unknown = -1,
        System = -2,
        SystemBadPackage = -3,
        Timeout = -4,
        Killed = -5,
        /// Actor queue or loop is saturated
        Busy = -6,

        RpcNoTask = -101,
        RpcExiting = -102,
        RpcSendFailed = -103,

        DbRecordNotFound = -201,
        DbCasCheckFailed = -202,

        RouterNotFound = -301,
        RouterNotWritable = -302,
        RouterClosing = -303,
        RouterTtlExtend = -304,
        RouterEagain = -305,
        RouterBussinessVersionDeny = -306,
    }
}
