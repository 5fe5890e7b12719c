//! Built-in permission tables for the services that share the interceptor

use super::{PermissionRegistry, PermissionRegistryBuilder, RegistryError};

/// Services with a built-in table
pub const SERVICES: &[&str] = &[
    "AuthService",
    "DepartmentService",
    "DesignationService",
    "VendorService",
    "OrganizationService",
    "UserService",
    "ProjectService",
];

pub fn for_service(service: &str) -> Result<PermissionRegistry, RegistryError> {
    let registry = match service {
        "AuthService" => auth_service(),
        "DepartmentService" => department_service(),
        "DesignationService" => designation_service(),
        "VendorService" => vendor_service(),
        "OrganizationService" => organization_service(),
        "UserService" => user_service(),
        "ProjectService" => project_service(),
        other => return Err(RegistryError::UnknownService(other.to_string())),
    };
    Ok(registry)
}

pub fn auth_service() -> PermissionRegistry {
    let mut builder = PermissionRegistry::builder("AuthService")
        .require("/AuthService/Register", ["create-user"])
        .require("/AuthService/SwitchOrganization", ["switch-organizations"])
        .require("/AuthService/CreateRole", ["create-role"])
        .require("/AuthService/GrantRolePermission", ["edit-role"])
        .require("/AuthService/AssignRole", ["edit-user"])
        .require("/AuthService/DeactivateUser", ["delete-user", "edit-user"]);

    for op in [
        "RegisterUserWithOrganization",
        "Login",
        "LoginGlobal",
        "ForgotPassword",
        "ForgotPasswordWithOTP",
        "VerifyOTPAndResetPassword",
        "ResetPasswordByToken",
        "SendVerificationEmail",
        "VerifyEmail",
        "ValidateToken",
        "RefreshToken",
    ] {
        builder = builder.public(format!("/AuthService/{op}"));
    }

    builder.build()
}

fn crud(
    service: &str,
    prefix: &str,
    entries: &[(&str, &str)],
) -> PermissionRegistryBuilder {
    entries
        .iter()
        .fold(PermissionRegistry::builder(service), |builder, (op, permission)| {
            builder.require(format!("{prefix}/{op}"), [*permission])
        })
}

pub fn department_service() -> PermissionRegistry {
    crud(
        "DepartmentService",
        "/department.v1.DepartmentService",
        &[
            ("CreateDepartment", "create-department"),
            ("GetDepartment", "view-departments"),
            ("ListDepartments", "view-departments"),
            ("UpdateDepartment", "edit-department"),
            ("DeleteDepartment", "delete-department"),
        ],
    )
    .build()
}

pub fn designation_service() -> PermissionRegistry {
    crud(
        "DesignationService",
        "/designation.v1.DesignationService",
        &[
            ("CreateDesignation", "create-designation"),
            ("GetDesignation", "view-designations"),
            ("ListDesignations", "view-designations"),
            ("UpdateDesignation", "edit-designation"),
            ("DeleteDesignation", "delete-designation"),
        ],
    )
    .build()
}

pub fn vendor_service() -> PermissionRegistry {
    crud(
        "VendorService",
        "/vendor.VendorService",
        &[
            ("CreateVendor", "create-vendors"),
            ("GetVendor", "view-vendors"),
            ("GetVendorByCode", "view-vendors"),
            ("ListVendors", "view-vendors"),
            ("UpdateVendor", "edit-vendors"),
            ("DeleteVendor", "delete-vendors"),
            ("UpdateVendorCode", "edit-vendors"),
            ("RegenerateVendorCode", "edit-vendors"),
            ("CreateVendorAccount", "edit-vendors"),
            ("GetVendorAccounts", "view-vendors"),
            ("GetVendorBankingDetails", "view-vendors"),
            ("UpdateVendorAccount", "edit-vendors"),
            ("DeleteVendorAccount", "edit-vendors"),
            ("ToggleAccountStatus", "edit-vendors"),
            ("GetProjectsDropdown", "view-vendors"),
        ],
    )
    // Code generation is used by the unauthenticated vendor form
    .public("/vendor.VendorService/GenerateVendorCode")
    .build()
}

pub fn organization_service() -> PermissionRegistry {
    crud(
        "OrganizationService",
        "/organizations.OrganizationService",
        &[
            ("GetOrganization", "view-organizations"),
            ("ListOrganizations", "view-organizations"),
            ("ListOrganizationsByTenant", "view-organizations"),
            ("UpdateOrganization", "edit-organization"),
            ("DeleteOrganization", "delete-organization"),
            ("AddUserToOrganization", "manage-organization-users"),
            ("RemoveUserFromOrganization", "manage-organization-users"),
            ("ListOrganizationUsers", "view-organizations"),
            ("GetUserOrganizations", "view-organizations"),
        ],
    )
    .public("/organizations.OrganizationService/CreateOrganization")
    .public("/organizations.OrganizationService/ListUserOrganizations")
    .build()
}

pub fn user_service() -> PermissionRegistry {
    let mut builder = crud(
        "UserService",
        "/UserManagement",
        &[
            ("GetTenant", "system-configuration"),
            ("CreateRole", "create-role"),
            ("ListRoles", "view-role"),
            ("ListRolesByOrganization", "view-role"),
            ("GetRole", "view-role"),
            ("UpdateRole", "edit-role"),
            ("DeleteRole", "delete-role"),
            ("CloneRole", "create-role"),
            ("CreateUser", "create-user"),
            ("GetUser", "view-user"),
            ("ListUsers", "view-user"),
            ("ListUsersPaginated", "view-user"),
            ("CountUsersByTenant", "view-user"),
            ("UpdateUser", "edit-user"),
            ("DeleteUser", "delete-user"),
            ("DeactivateUser", "delete-user"),
            ("ReactivateUser", "edit-user"),
            ("AssignRolesToUser", "edit-user"),
            ("UploadUserSignature", "edit-user"),
            ("AddUserToOrganization", "edit-organizations"),
            ("RemoveUserFromOrganization", "edit-organizations"),
            ("ListActivityLogs", "view-activity-logs"),
        ],
    );

    for op in [
        "CreateTenant",
        "ListUserOrganizations",
        "ListRolesOfUser",
        "CreateUserLoginHistory",
        "CreateActivityLog",
        "GetDepartmentsDropdown",
        "GetDesignationsDropdown",
        "GetRolesDropdown",
    ] {
        builder = builder.public(format!("/UserManagement/{op}"));
    }

    builder.build()
}

pub fn project_service() -> PermissionRegistry {
    crud(
        "ProjectService",
        "/project.ProjectService",
        &[
            ("GetProject", "view-projects"),
            ("ListProjects", "view-projects"),
            ("UpdateProject", "edit-project"),
            ("DeleteProject", "delete-project"),
            ("ListProjectsByOrganization", "view-projects"),
        ],
    )
    .public("/project.ProjectService/CreateProject")
    .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::registry::Requirement;

    #[test]
    fn test_every_listed_service_resolves() {
        for service in SERVICES {
            let registry = for_service(service).unwrap();
            assert_eq!(registry.service(), *service);
        }
        assert!(matches!(
            for_service("PaymentService"),
            Err(RegistryError::UnknownService(_))
        ));
    }

    #[test]
    fn test_auth_entry_points_are_public() {
        let registry = auth_service();
        for op in [
            "Login",
            "LoginGlobal",
            "RegisterUserWithOrganization",
            "RefreshToken",
            "ResetPasswordByToken",
        ] {
            assert!(registry.is_public(&format!("/AuthService/{op}")), "{op}");
        }
        assert_eq!(
            registry.requirement("/AuthService/Logout"),
            Requirement::Unrestricted
        );
    }

    #[test]
    fn test_switch_organization_requires_permission() {
        let registry = auth_service();
        match registry.requirement("/AuthService/SwitchOrganization") {
            Requirement::AnyOf(set) => assert!(set.contains("switch-organizations")),
            other => panic!("unexpected requirement {other:?}"),
        }
    }

    #[test]
    fn test_register_requires_create_user() {
        let registry = auth_service();
        assert!(!registry.is_public("/AuthService/Register"));
        match registry.requirement("/AuthService/Register") {
            Requirement::AnyOf(set) => assert!(set.contains("create-user")),
            other => panic!("unexpected requirement {other:?}"),
        }
    }

    #[test]
    fn test_no_operation_is_public_and_restricted() {
        for service in SERVICES {
            let registry = for_service(service).unwrap();
            for (op, _) in registry.operations() {
                assert!(!registry.is_public(op), "{service} {op}");
            }
        }
    }
}
