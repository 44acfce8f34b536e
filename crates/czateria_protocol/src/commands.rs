#![forbid(unsafe_code)]

use serde_json::{Value, json};

use crate::codes;

/// An outbound protocol command.
///
/// Builders are pure: `to_json` maps semantic fields onto the wire
/// object and never touches session state. Message bodies are expected
/// to already be in wire markup (see `MarkupConverter` in the session
/// crate).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
	/// Login reply to the server hello (code 108).
	Login {
		session_id: String,
		channel: String,
		nickname: String,
	},
	/// Room-wide chat message (code 1).
	RoomMessage { body: String },
	/// Private conversation invite carrying the first message (97/1).
	PrivateInvite { peer: String, body: String },
	/// Private message within an existing conversation (97/2).
	PrivateMessage { peer: String, body: String },
	/// Reject a peer's invite (97/13).
	PrivateReject { peer: String },
	/// Close or cancel a private conversation (97/14).
	PrivateClose { peer: String },
	/// Private image payload: base64 JPEG plus dimensions (97/25).
	PrivateImage {
		peer: String,
		width: u32,
		height: u32,
		data_base64: String,
	},
	/// Keepalive (code 1003).
	Keepalive,
	/// Session end, sent on teardown (code 80).
	SessionEnd,
}

fn code_obj(code: i64) -> Value {
	json!({ "code": code })
}

fn subcode_obj(code: i64, subcode: i64) -> Value {
	json!({ "code": code, "subcode": subcode })
}

/// Styling placeholders the service requires on every message-bearing
/// frame. This client always sends unstyled text.
fn insert_message_fields(obj: &mut Value, body: &str) {
	let map = obj.as_object_mut().expect("command objects are JSON objects");
	map.insert("msg".into(), json!(body));
	map.insert("msgColorId".into(), json!(0));
	map.insert("msgFontTypeId".into(), json!(0));
	map.insert("msgIsBold".into(), json!(false));
	map.insert("msgIsItalic".into(), json!(false));
	map.insert("msgIsUnderline".into(), json!(false));
}

fn insert_user(obj: &mut Value, peer: &str) {
	let map = obj.as_object_mut().expect("command objects are JSON objects");
	map.insert("user".into(), json!(peer));
}

impl Command {
	/// Build the wire object for this command.
	pub fn to_json(&self) -> Value {
		match self {
			Command::Login {
				session_id,
				channel,
				nickname,
			} => {
				// The placeholder profile/geolocation block is required by
				// the service but unused by this client.
				json!({
					"code": codes::LOGIN,
					"login": nickname,
					"cryptLogin": "",
					"slowLogin": false,
					"sessionId": session_id,
					"channelName": channel,
					"localIp": "127.0.0.1",
					"nickColorId": 0,
					"emotionId": 0,
					"cardDate": "0",
					"cardReasonId": 0,
					"cardSex": "0",
					"cardDescription": "",
					"cardSearchSex": "0",
					"cardSearchAgeFrom": 0,
					"cardSearchAgeTo": 0,
					"isHiddenMode": 0,
					"lat": 0,
					"lon": 0,
				})
			}
			Command::RoomMessage { body } => {
				let mut obj = code_obj(codes::ROOM_MESSAGE_OUT);
				insert_message_fields(&mut obj, body);
				obj
			}
			Command::PrivateInvite { peer, body } => {
				let mut obj = subcode_obj(codes::PRIVATE, codes::private::INVITE);
				insert_message_fields(&mut obj, body);
				insert_user(&mut obj, peer);
				obj
			}
			Command::PrivateMessage { peer, body } => {
				let mut obj = subcode_obj(codes::PRIVATE, codes::private::MESSAGE);
				insert_message_fields(&mut obj, body);
				insert_user(&mut obj, peer);
				obj
			}
			Command::PrivateReject { peer } => {
				let mut obj = subcode_obj(codes::PRIVATE, codes::private::REJECTED);
				insert_user(&mut obj, peer);
				obj
			}
			Command::PrivateClose { peer } => {
				let mut obj = subcode_obj(codes::PRIVATE, codes::private::CLOSED);
				insert_user(&mut obj, peer);
				obj
			}
			Command::PrivateImage {
				peer,
				width,
				height,
				data_base64,
			} => {
				let mut obj = subcode_obj(codes::PRIVATE, codes::private::IMAGE);
				insert_user(&mut obj, peer);
				let map = obj.as_object_mut().expect("command objects are JSON objects");
				map.insert("type".into(), json!(1));
				map.insert("imgWidth".into(), json!(width));
				map.insert("imgHeight".into(), json!(height));
				map.insert("data".into(), json!(data_base64));
				obj
			}
			Command::Keepalive => code_obj(codes::KEEPALIVE),
			Command::SessionEnd => code_obj(codes::SESSION_END),
		}
	}

	/// Serialize to a compact single-line text frame.
	pub fn encode(&self) -> String {
		self.to_json().to_string()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn field<'a>(v: &'a Value, key: &str) -> &'a Value {
		v.get(key).unwrap_or_else(|| panic!("missing field {key}"))
	}

	#[test]
	fn login_carries_identity_and_placeholder_block() {
		let cmd = Command::Login {
			session_id: "sid-1".into(),
			channel: "Pogaduchy".into(),
			nickname: "alice".into(),
		};
		let v = cmd.to_json();
		assert_eq!(field(&v, "code"), &json!(108));
		assert_eq!(field(&v, "login"), &json!("alice"));
		assert_eq!(field(&v, "sessionId"), &json!("sid-1"));
		assert_eq!(field(&v, "channelName"), &json!("Pogaduchy"));
		assert_eq!(field(&v, "slowLogin"), &json!(false));
		assert_eq!(field(&v, "lat"), &json!(0));
		assert_eq!(field(&v, "lon"), &json!(0));
		assert_eq!(field(&v, "cardSex"), &json!("0"));
	}

	#[test]
	fn room_message_is_unstyled() {
		let v = Command::RoomMessage { body: "hello".into() }.to_json();
		assert_eq!(field(&v, "code"), &json!(1));
		assert_eq!(field(&v, "msg"), &json!("hello"));
		assert_eq!(field(&v, "msgIsBold"), &json!(false));
		assert_eq!(field(&v, "msgColorId"), &json!(0));
	}

	#[test]
	fn private_commands_address_the_peer() {
		let invite = Command::PrivateInvite {
			peer: "bob".into(),
			body: "hi".into(),
		}
		.to_json();
		assert_eq!(field(&invite, "code"), &json!(97));
		assert_eq!(field(&invite, "subcode"), &json!(1));
		assert_eq!(field(&invite, "user"), &json!("bob"));
		assert_eq!(field(&invite, "msg"), &json!("hi"));

		let reject = Command::PrivateReject { peer: "bob".into() }.to_json();
		assert_eq!(field(&reject, "subcode"), &json!(13));
		assert_eq!(field(&reject, "user"), &json!("bob"));

		let close = Command::PrivateClose { peer: "bob".into() }.to_json();
		assert_eq!(field(&close, "subcode"), &json!(14));
	}

	#[test]
	fn image_payload_embeds_dimensions_and_data() {
		let v = Command::PrivateImage {
			peer: "bob".into(),
			width: 320,
			height: 200,
			data_base64: "AAAA".into(),
		}
		.to_json();
		assert_eq!(field(&v, "subcode"), &json!(25));
		assert_eq!(field(&v, "type"), &json!(1));
		assert_eq!(field(&v, "imgWidth"), &json!(320));
		assert_eq!(field(&v, "imgHeight"), &json!(200));
		assert_eq!(field(&v, "data"), &json!("AAAA"));
	}

	#[test]
	fn encode_is_single_line() {
		let s = Command::Keepalive.encode();
		assert_eq!(s, r#"{"code":1003}"#);
		assert!(!Command::SessionEnd.encode().contains('\n'));
	}
}
