use crate::db::DatabaseError;
use serde::{Deserialize, Serialize};

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

str_enum!(UserRole {
    Patient => "patient",
    Staff => "staff",
    Owner => "owner",
    Attendant => "attendant",
});

str_enum!(AppointmentStatus {
    Pending => "pending",
    Confirmed => "confirmed",
    Completed => "completed",
    Cancelled => "cancelled",
});

str_enum!(RequestStatus {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
});

str_enum!(UnavailabilityStatus {
    Pending => "pending",
    Resolved => "resolved",
});

str_enum!(PatientChoice {
    ChooseAnother => "choose_another",
    RescheduleSame => "reschedule_same",
    Cancel => "cancel",
});

str_enum!(NotificationKind {
    Appointment => "appointment",
    Cancellation => "cancellation",
    Reschedule => "reschedule",
    Leave => "leave",
    Unavailability => "unavailability",
    Feedback => "feedback",
    System => "system",
});

str_enum!(SmsStatus {
    Sent => "sent",
    Failed => "failed",
    Pending => "pending",
});

str_enum!(TemplateType {
    Confirmation => "confirmation",
    Reminder => "reminder",
    Cancellation => "cancellation",
    PackageConfirmation => "package_confirmation",
    AttendantReassignment => "attendant_reassignment",
    Custom => "custom",
});

str_enum!(HistoryAction {
    Add => "add",
    Edit => "edit",
    Archive => "archive",
    Book => "book",
    Confirm => "confirm",
    Cancel => "cancel",
    Complete => "complete",
    Reschedule => "reschedule",
    Reject => "reject",
    Approve => "approve",
});

str_enum!(ItemKind {
    Service => "service",
    Product => "product",
    Package => "package",
});
