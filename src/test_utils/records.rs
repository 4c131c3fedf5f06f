use crate::impl_hash_record;

#[derive(Clone, PartialEq, prost::Message)]
pub struct UserProfile {
    #[prost(string, tag = "1")]
    pub signature: String,
    #[prost(int32, tag = "2")]
    pub head_id: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct UserTable {
    #[prost(uint64, tag = "1")]
    pub uid: u64,
    #[prost(uint32, tag = "2")]
    pub lv: u32,
    #[prost(string, tag = "3")]
    pub nickname: String,
    #[prost(message, optional, tag = "4")]
    pub profile: Option<UserProfile>,
    #[prost(double, tag = "5")]
    pub score: f64,
    #[prost(bool, tag = "6")]
    pub online: bool,
    #[prost(bytes = "vec", tag = "7")]
    pub avatar: Vec<u8>,
    #[prost(int64, tag = "8")]
    pub router_server_id: i64,
}

impl_hash_record!(UserTable {
    uid,
    lv,
    nickname,
    profile,
    score,
    online,
    avatar,
    router_server_id,
});

/// List-indexed sub-record, e.g. one mail of a mailbox hash.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MailItem {
    #[prost(uint64, tag = "1")]
    pub mail_id: u64,
    #[prost(string, tag = "2")]
    pub title: String,
}

pub fn sample_user(uid: u64) -> UserTable {
    UserTable {
        uid,
        lv: 1,
        nickname: format!("player-{uid}"),
        profile: Some(UserProfile {
            signature: "hello".to_string(),
            head_id: 3,
        }),
        score: 12.5,
        online: true,
        avatar: vec![0, 1, 2],
        router_server_id: 0,
    }
}

pub fn sample_mail(
    mail_id: u64,
    title: &str,
) -> MailItem {
    MailItem {
        mail_id,
        title: title.to_string(),
    }
}
