//! Login forms shown in the placeholder world.
//!
//! Clients discard modal forms that arrive while the loading screen is up,
//! so the open form is cached and only sent once the client reports it has
//! finished loading. The cached form is sent again at that point.

use serde_json::json;

use super::auth::DeviceCode;
use super::{DisconnectKind, Session};
use crate::lang;
use crate::protocol::front::FrontPacket;

pub const LOGIN_NOTICE_FORM: u32 = 1;
pub const DEVICE_CODE_FORM: u32 = 2;
pub const TOKEN_EXPIRED_FORM: u32 = 3;

/// What a form answer asks the session to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormAction {
    Login,
    Disconnect,
    /// Form closed without an answer; show it again
    Reshow,
    Ignore,
}

/// Button list form as JSON
pub fn simple_form(title: &str, content: &str, buttons: &[&str]) -> String {
    let buttons: Vec<_> = buttons.iter().map(|text| json!({ "text": text })).collect();
    json!({
        "type": "form",
        "title": title,
        "content": content,
        "buttons": buttons,
    })
    .to_string()
}

/// Index of the pressed button; `None` when the form was closed.
pub fn pressed_button(response: Option<&str>) -> Option<usize> {
    let raw = response?.trim();
    match serde_json::from_str::<serde_json::Value>(raw).ok()? {
        serde_json::Value::Number(n) => n.as_u64().map(|n| n as usize),
        _ => None,
    }
}

/// Map an answer to one of the login forms onto an action.
pub fn classify_response(form_id: u32, response: Option<&str>) -> FormAction {
    let button = pressed_button(response);
    match (form_id, button) {
        (LOGIN_NOTICE_FORM | TOKEN_EXPIRED_FORM, Some(0)) => FormAction::Login,
        (LOGIN_NOTICE_FORM | TOKEN_EXPIRED_FORM, Some(1)) => FormAction::Disconnect,
        (LOGIN_NOTICE_FORM | TOKEN_EXPIRED_FORM | DEVICE_CODE_FORM, None) => FormAction::Reshow,
        (DEVICE_CODE_FORM, Some(0)) => FormAction::Disconnect,
        _ => FormAction::Ignore,
    }
}

impl Session {
    /// Cache `form_data` as the open form and send it if the client can
    /// display it yet.
    fn present_form(&mut self, form_id: u32, form_data: String) {
        self.shown_form = Some(form_id);
        self.form_cache = Some((form_id, form_data));
        if self.client_loaded {
            self.send_cached_form();
        } else {
            tracing::debug!("[forms] [deferred] session={} form={}", self.id, form_id);
        }
    }

    pub(super) fn send_cached_form(&mut self) {
        let Some((form_id, form_data)) = self.form_cache.clone() else {
            return;
        };
        self.send_front(&FrontPacket::ModalFormRequest { form_id, form_data });
    }

    pub(super) fn clear_forms(&mut self) {
        self.shown_form = None;
        self.form_cache = None;
    }

    pub(super) fn show_login_notice(&mut self) {
        let messages = &self.ctx.messages;
        let form = simple_form(
            messages.get(lang::LOGIN_NOTICE_TITLE),
            messages.get(lang::LOGIN_NOTICE_BODY),
            &[messages.get(lang::LOGIN_BUTTON), messages.get(lang::DISCONNECT_BUTTON)],
        );
        self.present_form(LOGIN_NOTICE_FORM, form);
    }

    pub(super) fn show_token_expired(&mut self) {
        let messages = &self.ctx.messages;
        let form = simple_form(
            messages.get(lang::TOKEN_EXPIRED_TITLE),
            messages.get(lang::TOKEN_EXPIRED_BODY),
            &[messages.get(lang::LOGIN_BUTTON), messages.get(lang::DISCONNECT_BUTTON)],
        );
        self.present_form(TOKEN_EXPIRED_FORM, form);
    }

    pub(super) fn show_device_code(&mut self, code: &DeviceCode) {
        let messages = &self.ctx.messages;
        let body = messages.format(lang::DEVICE_CODE_BODY, &[&code.verification_uri, &code.user_code]);
        let form = simple_form(
            messages.get(lang::DEVICE_CODE_TITLE),
            &body,
            &[messages.get(lang::DISCONNECT_BUTTON)],
        );
        self.device_code = Some(code.clone());
        self.present_form(DEVICE_CODE_FORM, form);
    }

    pub(super) fn handle_form_response(&mut self, form_id: u32, response: Option<String>) {
        if self.shown_form != Some(form_id) {
            tracing::debug!("[forms] [stale_response] session={} form={}", self.id, form_id);
            return;
        }
        self.clear_forms();

        match classify_response(form_id, response.as_deref()) {
            FormAction::Login => self.start_device_code_login(),
            FormAction::Disconnect => self.disconnect(DisconnectKind::ClientQuit, "declined login"),
            FormAction::Reshow => match form_id {
                LOGIN_NOTICE_FORM => self.show_login_notice(),
                TOKEN_EXPIRED_FORM => self.show_token_expired(),
                _ => match self.device_code.clone() {
                    Some(code) => self.show_device_code(&code),
                    None => self.show_login_notice(),
                },
            },
            FormAction::Ignore => {
                tracing::debug!("[forms] [ignored] session={} form={}", self.id, form_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_form_json() {
        let form = simple_form("T", "C", &["a", "b"]);
        let value: serde_json::Value = serde_json::from_str(&form).unwrap();
        assert_eq!(value["type"], "form");
        assert_eq!(value["buttons"][1]["text"], "b");
    }

    #[test]
    fn test_pressed_button() {
        assert_eq!(pressed_button(Some("0")), Some(0));
        assert_eq!(pressed_button(Some("1\n")), Some(1));
        assert_eq!(pressed_button(Some("null")), None);
        assert_eq!(pressed_button(None), None);
    }

    #[test]
    fn test_classify_response() {
        assert_eq!(classify_response(LOGIN_NOTICE_FORM, Some("0")), FormAction::Login);
        assert_eq!(classify_response(LOGIN_NOTICE_FORM, Some("1")), FormAction::Disconnect);
        assert_eq!(classify_response(TOKEN_EXPIRED_FORM, None), FormAction::Reshow);
        assert_eq!(classify_response(DEVICE_CODE_FORM, None), FormAction::Reshow);
        assert_eq!(classify_response(DEVICE_CODE_FORM, Some("0")), FormAction::Disconnect);
        assert_eq!(classify_response(99, Some("0")), FormAction::Ignore);
    }
}
