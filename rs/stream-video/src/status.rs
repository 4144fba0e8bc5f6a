use crate::Error;

/// The result of one submitted buffer, as the transport sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive)]
#[repr(i32)]
pub enum SubmitStatus {
	Ok = 0,

	/// The buffer was dropped and a key frame is needed before decoding can continue.
	NeedIdr = -1,

	/// The buffer was dropped; later buffers are still decodable.
	Dropped = -2,

	/// The session can't accept buffers.
	Fatal = -3,
}

/// Converts a result into the integer reported across the transport boundary.
pub trait ReturnCode {
	fn code(&self) -> i32;
}

impl ReturnCode for () {
	fn code(&self) -> i32 {
		0
	}
}

impl ReturnCode for SubmitStatus {
	fn code(&self) -> i32 {
		(*self).into()
	}
}

impl<T: ReturnCode> ReturnCode for Result<T, Error> {
	fn code(&self) -> i32 {
		match self {
			Ok(ok) => ok.code(),
			Err(err) => err.code(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_codes() {
		assert_eq!(SubmitStatus::Ok.code(), 0);
		assert_eq!(SubmitStatus::NeedIdr.code(), -1);
		assert_eq!(SubmitStatus::Dropped.code(), -2);
		assert_eq!(SubmitStatus::Fatal.code(), -3);
		assert_eq!(SubmitStatus::try_from(-2).unwrap(), SubmitStatus::Dropped);
	}

	#[test]
	fn test_result_codes() {
		assert_eq!(Ok::<_, Error>(()).code(), 0);
		assert_eq!(Err::<(), _>(Error::AlreadySetup).code(), Error::AlreadySetup.code());
		assert_eq!(Ok::<_, Error>(SubmitStatus::NeedIdr).code(), -1);
	}
}
