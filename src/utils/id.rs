/// 32 hex characters, no hyphens.
pub fn longid() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
