use uuid::Uuid;

pub fn chat_completion_id() -> String {
    let s = Uuid::new_v4().to_string();
    let prefix = s.split('-').next().unwrap_or(&s);
    format!("chatcmpl-{prefix}")
}

pub fn message_id() -> String {
    format!("msg_{}", Uuid::new_v4().simple())
}

pub fn api_key_id() -> String {
    format!("key_{}", Uuid::new_v4().simple())
}
