//! Notification events exchanged between the product and notification services.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event type carried by every notification request.
pub const CREATE_NOTIFICATION_EVENT: &str = "CreateNotificationEvent";

/// Request for the notification service to notify a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNotificationEvent {
    pub user_id: Uuid,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<Uuid>,
    /// Identity-provider id of the user, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

impl CreateNotificationEvent {
    pub fn new(user_id: Uuid, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            user_id,
            title: title.into(),
            message: message.into(),
            product_id: None,
            external_id: None,
        }
    }

    /// Notification for a product lifecycle change.
    pub fn for_product(
        change: ProductChange,
        user_id: Uuid,
        product_id: Uuid,
        product_title: &str,
    ) -> Self {
        Self {
            product_id: Some(product_id),
            ..Self::new(
                user_id,
                NotificationMessages::title(change),
                NotificationMessages::message(change, product_title),
            )
        }
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }
}

/// Product lifecycle changes that produce a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductChange {
    Created,
    Updated,
    Deleted,
}

/// Titles and messages for product notifications.
pub struct NotificationMessages;

impl NotificationMessages {
    pub const PRODUCT_CREATED_TITLE: &'static str = "Product created";
    pub const PRODUCT_UPDATED_TITLE: &'static str = "Product updated";
    pub const PRODUCT_DELETED_TITLE: &'static str = "Product deleted";

    pub fn title(change: ProductChange) -> &'static str {
        match change {
            ProductChange::Created => Self::PRODUCT_CREATED_TITLE,
            ProductChange::Updated => Self::PRODUCT_UPDATED_TITLE,
            ProductChange::Deleted => Self::PRODUCT_DELETED_TITLE,
        }
    }

    pub fn message(change: ProductChange, product_title: &str) -> String {
        match change {
            ProductChange::Created => Self::product_created(product_title),
            ProductChange::Updated => Self::product_updated(product_title),
            ProductChange::Deleted => Self::product_deleted(product_title),
        }
    }

    pub fn product_created(product_title: &str) -> String {
        format!("Your product '{}' has been successfully published!", product_title)
    }

    pub fn product_updated(product_title: &str) -> String {
        format!("Your product '{}' has been successfully updated!", product_title)
    }

    pub fn product_deleted(product_title: &str) -> String {
        format!("Your product '{}' has been successfully deleted.", product_title)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_serializes_camel_case_without_absent_fields() {
        let user_id = Uuid::new_v4();
        let event = CreateNotificationEvent::new(user_id, "Hello", "World");

        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(
            value,
            json!({"userId": user_id.to_string(), "title": "Hello", "message": "World"})
        );
    }

    #[test]
    fn test_deserializes_optional_fields() {
        let user_id = Uuid::new_v4();
        let product_id = Uuid::new_v4();
        let raw = json!({
            "userId": user_id,
            "title": "t",
            "message": "m",
            "productId": product_id,
            "externalId": "auth0|42"
        });

        let event: CreateNotificationEvent = serde_json::from_value(raw).unwrap();

        assert_eq!(event.product_id, Some(product_id));
        assert_eq!(event.external_id.as_deref(), Some("auth0|42"));
    }

    #[test]
    fn test_product_notifications() {
        let user_id = Uuid::new_v4();
        let product_id = Uuid::new_v4();

        let created = CreateNotificationEvent::for_product(ProductChange::Created, user_id, product_id, "Desk")
            .with_external_id("auth0|1");
        assert_eq!(created.title, "Product created");
        assert_eq!(created.message, "Your product 'Desk' has been successfully published!");
        assert_eq!(created.product_id, Some(product_id));
        assert_eq!(created.external_id.as_deref(), Some("auth0|1"));

        let updated = CreateNotificationEvent::for_product(ProductChange::Updated, user_id, product_id, "Desk");
        assert_eq!(updated.title, "Product updated");
        assert_eq!(updated.message, "Your product 'Desk' has been successfully updated!");

        let deleted = CreateNotificationEvent::for_product(ProductChange::Deleted, user_id, product_id, "Desk");
        assert_eq!(deleted.title, "Product deleted");
        assert_eq!(deleted.message, "Your product 'Desk' has been successfully deleted.");
    }
}
