use crate::entities::OrderStatus;
use crate::errors::ServiceError;

/// How the caller relates to an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Participant {
    pub is_buyer: bool,
    pub is_seller: bool,
}

impl Participant {
    pub fn is_party(&self) -> bool {
        self.is_buyer || self.is_seller
    }
}

/// Who is asking for a status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusActor {
    /// A buyer or seller through the order update endpoint
    Caller(Participant),
    /// Payment reconciliation or checkout compensation
    System,
}

/// Validates if a status transition is allowed
pub fn is_valid_transition(from: OrderStatus, to: OrderStatus) -> bool {
    use OrderStatus::*;

    matches!(
        (from, to),
        (Pending, Paid)
            | (Pending, Cancelled)
            | (Paid, Shipped)
            | (Paid, Cancelled)
            | (Shipped, Delivered)
    )
}

pub fn is_terminal(status: OrderStatus) -> bool {
    matches!(status, OrderStatus::Delivered | OrderStatus::Cancelled)
}

/// Checks a requested move and returns whether it changes anything.
///
/// Same-status writes are accepted as no-ops so repeated deliveries stay harmless.
pub fn check_transition(
    from: OrderStatus,
    to: OrderStatus,
    actor: StatusActor,
) -> Result<bool, ServiceError> {
    if let StatusActor::Caller(participant) = actor {
        authorize(to, participant)?;
    }

    if from == to {
        return Ok(false);
    }

    if is_terminal(from) {
        return Err(ServiceError::BadRequest(format!("Order is already {}", from)));
    }

    if !is_valid_transition(from, to) {
        return Err(ServiceError::BadRequest(format!(
            "Cannot transition order from '{}' to '{}'",
            from, to
        )));
    }

    Ok(true)
}

fn authorize(to: OrderStatus, participant: Participant) -> Result<(), ServiceError> {
    match to {
        OrderStatus::Pending => Err(ServiceError::BadRequest(
            "Orders cannot be moved back to 'pending'".to_string(),
        )),
        OrderStatus::Paid => Err(ServiceError::BadRequest(
            "Order status 'paid' is set by payment confirmation".to_string(),
        )),
        OrderStatus::Shipped | OrderStatus::Delivered if !participant.is_seller => Err(
            ServiceError::Unauthorized(format!("Only a seller on this order can mark it {}", to)),
        ),
        OrderStatus::Cancelled if !participant.is_party() => Err(ServiceError::Unauthorized(
            "Not a participant in this order".to_string(),
        )),
        _ => Ok(()),
    }
}
